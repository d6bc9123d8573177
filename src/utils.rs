use indicatif::{ProgressBar, ProgressStyle};

pub fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {human_pos}/{human_len} {percent}% ({per_sec})")
        .expect("hardcoded")
}

pub fn progress_bar(len: u64) -> ProgressBar {
    ProgressBar::new(len).with_style(progress_style())
}

/// Comparison key for area codes and names: trimmed and lowercased.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_lowercase()
}
