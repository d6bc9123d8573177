use std::{collections::BTreeMap, fmt::Write};

use crate::{error::ZoneError, matcher::Conflict};

#[derive(Debug)]
pub enum ZoneOutcome {
    Written,
    /// Geometry was already set.
    Skipped,
    Failed(ZoneError),
    /// Never started because the run was cancelled.
    Cancelled,
}

#[derive(Debug)]
pub struct ZoneResult {
    pub code: String,
    pub outcome: ZoneOutcome,
    pub warnings: Vec<String>,
}

/// Summary of a resolution run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub resolved: Vec<String>,
    pub skipped: usize,
    pub cancelled: Vec<String>,
    /// Failure kind -> (zone code, reason).
    pub failed: BTreeMap<&'static str, Vec<(String, String)>>,
    pub conflicts: Vec<Conflict>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn record(&mut self, result: ZoneResult) {
        self.warnings.extend(result.warnings);
        match result.outcome {
            ZoneOutcome::Written => self.resolved.push(result.code),
            ZoneOutcome::Skipped => self.skipped += 1,
            ZoneOutcome::Cancelled => self.cancelled.push(result.code),
            ZoneOutcome::Failed(e) => self
                .failed
                .entry(e.kind())
                .or_default()
                .push((result.code, e.to_string())),
        }
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.values().map(Vec::len).sum()
    }

    /// Zone codes that failed with `kind`, e.g. `"NoMatchFound"`.
    pub fn failed_codes(&self, kind: &str) -> Vec<&str> {
        self.failed
            .get(kind)
            .map(|x| x.iter().map(|(code, _)| code.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn to_markdown(&self) -> Result<String, std::fmt::Error> {
        let mut md = String::new();
        writeln!(md, "## Statistics\n")?;
        writeln!(md, "- {} resolved", self.resolved_count())?;
        writeln!(md, "- {} skipped (geometry already set)", self.skipped)?;
        writeln!(md, "- {} failed", self.failed_count())?;
        if !self.cancelled.is_empty() {
            writeln!(md, "- {} cancelled", self.cancelled.len())?;
        }
        writeln!(md, "- {} conflicts", self.conflicts.len())?;
        writeln!(md)?;

        if !self.failed.is_empty() {
            writeln!(md, "## Failures\n")?;
            for (kind, zones) in &self.failed {
                writeln!(md, "- {kind}:")?;
                for (code, reason) in zones {
                    writeln!(md, "  - {code:?}: {reason}")?;
                }
            }
            writeln!(md)?;
        }

        if !self.conflicts.is_empty() {
            writeln!(md, "## Conflicts\n")?;
            for x in &self.conflicts {
                writeln!(md, "- {x}")?;
            }
            writeln!(md)?;
        }

        if !self.warnings.is_empty() {
            writeln!(md, "## Warnings\n")?;
            for x in &self.warnings {
                writeln!(md, "- {x}")?;
            }
            writeln!(md)?;
        }

        if !self.cancelled.is_empty() {
            writeln!(md, "## Cancelled\n")?;
            for x in &self.cancelled {
                writeln!(md, "- {x:?}")?;
            }
        }
        Ok(md)
    }
}
