//! Recover command implementation.

use super::open_existing;
use crate::Format;
use serde::Serialize;
use std::path::Path;
use xfstore_core::RecoveryReport;

/// Recovery result.
#[derive(Debug, Serialize)]
pub struct RecoverResult {
    /// Data directory path.
    pub path: String,
    /// Transactions replayed, in commit order.
    pub replayed: Vec<String>,
    /// Transactions rolled back.
    pub rolled_back: Vec<String>,
    /// Distributed transactions left for their manager.
    pub unresolved: Vec<String>,
    /// Journals removed because no log referenced them.
    pub orphan_journals: usize,
}

impl RecoverResult {
    fn from_report(path: &Path, report: &RecoveryReport) -> Self {
        Self {
            path: path.display().to_string(),
            replayed: report.replayed.iter().map(ToString::to_string).collect(),
            rolled_back: report.rolled_back.iter().map(ToString::to_string).collect(),
            unresolved: report
                .unresolved
                .iter()
                .map(|g| xfstore_core::Xid::Global(g.clone()).to_string())
                .collect(),
            orphan_journals: report.orphan_journals,
        }
    }
}

/// Opens the data directory, which recovers it, then closes it again.
pub fn recover(path: &Path, sync: bool) -> Result<RecoverResult, Box<dyn std::error::Error>> {
    let tm = open_existing(path, sync)?;
    let result = RecoverResult::from_report(path, tm.recovery_report());
    tm.close();
    Ok(result)
}

/// Runs the recover command.
pub fn run(path: &Path, sync: bool, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let result = recover(path, sync)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text(&result),
    }
    Ok(())
}

fn print_text(result: &RecoverResult) {
    println!("Recovered: {}", result.path);
    println!("  Replayed:        {}", result.replayed.len());
    for xid in &result.replayed {
        println!("    {xid}");
    }
    println!("  Rolled back:     {}", result.rolled_back.len());
    for xid in &result.rolled_back {
        println!("    {xid}");
    }
    println!("  Awaiting decision: {}", result.unresolved.len());
    for xid in &result.unresolved {
        println!("    {xid}");
    }
    println!("  Orphan journals: {}", result.orphan_journals);
}
