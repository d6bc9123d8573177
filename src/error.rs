use thiserror::Error;

use crate::store::StoreError;

/// Per-zone failures. All but `NoGeometryAvailable` are collected into the
/// run report instead of stopping the run.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("no municipality matches the zone")]
    NoMatchFound,
    #[error("invalid geometry for {code}: {reason}")]
    InvalidGeometry { code: String, reason: String },
    #[error("union attempted over zero geometries")]
    NoGeometryAvailable,
    #[error("write failed after {attempts} attempt(s): {source}")]
    StoreWriteFailure {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}

impl ZoneError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoMatchFound => "NoMatchFound",
            Self::InvalidGeometry { .. } => "InvalidGeometry",
            Self::NoGeometryAvailable => "NoGeometryAvailable",
            Self::StoreWriteFailure { .. } => "StoreWriteFailure",
        }
    }
}

/// Reference data could not be fetched; the run cannot continue.
#[derive(Debug, Error)]
#[error("StoreReadFailure: cannot read {table}: {source}")]
pub struct StoreReadFailure {
    pub table: String,
    #[source]
    pub source: StoreError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = ZoneError::InvalidGeometry {
            code: "DE_1".into(),
            reason: "ring has 3 positions".into(),
        };
        assert_eq!(err.to_string(), "invalid geometry for DE_1: ring has 3 positions");
        assert_eq!(err.kind(), "InvalidGeometry");

        let err = ZoneError::StoreWriteFailure {
            attempts: 4,
            source: StoreError::Timeout("30s".into()),
        };
        assert_eq!(
            err.to_string(),
            "write failed after 4 attempt(s): request timed out: 30s"
        );

        let err = StoreReadFailure {
            table: "Municipality".into(),
            source: StoreError::Transport("refused".into()),
        };
        assert!(err.to_string().contains("cannot read Municipality"));
    }
}
