use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

pub mod distribution_zone;
pub mod export;

/// Shared stop flag, checked before each unit of work starts.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
