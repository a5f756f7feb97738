//! Logs command implementation.

use crate::Format;
use serde::Serialize;
use std::path::Path;
use xfstore_core::inspect_logs;

/// A recovery log found in the data directory.
#[derive(Debug, Serialize)]
pub struct LogEntry {
    /// Transaction stem.
    pub xid: String,
    /// Encoded status, e.g. `p` or `dCOMMITTED`.
    pub status: String,
    /// Commit order, once decided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<u64>,
    /// Range item paths touched.
    pub ranges: Vec<String>,
    /// Point item paths touched.
    pub points: Vec<String>,
    /// Blob items modified.
    pub blobs: Vec<String>,
}

/// Reads every recovery log without changing anything.
pub fn collect(path: &Path) -> Result<Vec<LogEntry>, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No data directory found at {}", path.display()).into());
    }
    let logs = inspect_logs(path)?;
    Ok(logs
        .into_iter()
        .map(|log| LogEntry {
            xid: log.xid.to_string(),
            status: log.status.to_string(),
            order: log.order,
            ranges: log.ranges,
            points: log.points,
            blobs: log.blobs.iter().map(ToString::to_string).collect(),
        })
        .collect())
}

/// Runs the logs command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let entries = collect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            if entries.is_empty() {
                println!("No recovery logs in {}", path.display());
            }
            for entry in &entries {
                print!("{:<32} {:<18}", entry.xid, entry.status);
                if let Some(order) = entry.order {
                    print!(" order={order}");
                }
                println!(
                    " ranges={} points={} blobs={}",
                    entry.ranges.len(),
                    entry.points.len(),
                    entry.blobs.len()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn lists_logs_without_touching_them() {
        let dir = tempdir().unwrap();
        let xlog = dir.path().join("xlog");
        fs::create_dir_all(&xlog).unwrap();
        fs::write(xlog.join("L7.local"), "p\nR /ts/a\n").unwrap();

        let entries = collect(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].xid, "L7");
        assert_eq!(entries[0].status, "p");
        assert_eq!(entries[0].ranges, vec!["/ts/a".to_string()]);
        assert!(xlog.join("L7.local").exists());
    }

    #[test]
    fn empty_directory_has_no_logs() {
        let dir = tempdir().unwrap();
        assert!(collect(dir.path()).unwrap().is_empty());
    }
}
