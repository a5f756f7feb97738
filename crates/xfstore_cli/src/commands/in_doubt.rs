//! In-doubt and forget command implementations.

use super::open_existing;
use crate::Format;
use serde::Serialize;
use std::path::Path;
use xfstore_core::{DeadState, Xid};

/// A distributed transaction awaiting its manager.
#[derive(Debug, Serialize)]
pub struct InDoubtEntry {
    /// Transaction stem, usable with `forget`.
    pub xid: String,
    /// Format identifier.
    pub format_id: i32,
    /// Outcome recorded by recovery.
    pub outcome: &'static str,
}

fn outcome_name(state: DeadState) -> &'static str {
    match state {
        DeadState::Committed => "committed",
        DeadState::Rollback => "rolled back",
        DeadState::HeuristicMixed => "heuristic mixed",
    }
}

/// Opens the data directory and lists transactions resolved by recovery.
pub fn collect(path: &Path) -> Result<Vec<InDoubtEntry>, Box<dyn std::error::Error>> {
    let tm = open_existing(path, true)?;
    let entries = tm
        .resolved_xa()
        .into_iter()
        .map(|status| InDoubtEntry {
            xid: Xid::Global(status.xid.clone()).to_string(),
            format_id: status.xid.format_id,
            outcome: outcome_name(status.state),
        })
        .collect();
    tm.close();
    Ok(entries)
}

/// Runs the in-doubt command.
pub fn list(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let entries = collect(path)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        Format::Text => {
            if entries.is_empty() {
                println!("No distributed transactions awaiting a decision");
            }
            for entry in &entries {
                println!("{:<40} {}", entry.xid, entry.outcome);
            }
        }
    }
    Ok(())
}

/// Runs the forget command.
pub fn forget(path: &Path, stem: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Xid::Global(global) = Xid::from_file_stem(stem)? else {
        return Err(format!("{stem} is not a distributed transaction").into());
    };
    let tm = open_existing(path, true)?;
    let result = tm.forget_xa(&global);
    tm.close();
    result?;
    println!("Forgot {stem}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use xfstore_core::{Config, GlobalXid, TransactionManager};
    use xfstore_storage::ItemId;

    fn leave_prepared_branch(path: &Path, g: &GlobalXid) {
        let tm = TransactionManager::open(path, Config::new().sync_on_commit(false)).unwrap();
        tm.start_xa(g, None).unwrap();
        let xid = Xid::Global(g.clone());
        tm.open_range(&xid, &ItemId::parse("/ts/x").unwrap(), true)
            .unwrap()
            .write(&xid, 0, b"x", 1)
            .unwrap();
        tm.prepare_xa(g).unwrap();
        tm.close();
    }

    #[test]
    fn prepared_branch_is_listed_then_forgotten() {
        let dir = tempdir().unwrap();
        let g = GlobalXid::new(7, *b"g", *b"b");
        leave_prepared_branch(dir.path(), &g);

        let entries = collect(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].format_id, 7);
        assert_eq!(entries[0].outcome, "rolled back");

        forget(dir.path(), &entries[0].xid).unwrap();
        assert!(collect(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn local_stem_cannot_be_forgotten() {
        let dir = tempdir().unwrap();
        assert!(forget(dir.path(), "L3").is_err());
    }
}
