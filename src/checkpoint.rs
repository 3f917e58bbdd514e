//! Checkpoint file: the last durably processed transaction id for one
//! `(database, index)` pair, stored as decimal text at
//! `CHECKPOINT_PATH/.{database}_{index}`. Written atomically
//! (write-then-replace) and clamped so the value never decreases.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    current: Option<i64>,
}

impl Checkpoint {
    pub fn new(directory: &Path, name: &str) -> Result<Self> {
        let path = directory.join(format!(".{name}"));
        let current = read_txid(&path)?;
        Ok(Self { path, current })
    }

    pub fn get(&self) -> Option<i64> {
        self.current
    }

    /// Advance to `txid`. Proposals below the current value are ignored so
    /// a replay can never move the checkpoint backwards.
    pub fn advance(&mut self, txid: i64) -> Result<i64> {
        let next = match self.current {
            Some(current) => current.max(txid),
            None => txid,
        };
        if self.current != Some(next) {
            let tmp = self.path.with_extension("tmp");
            fs::write(&tmp, format!("{next}\n"))
                .with_context(|| format!("failed to write checkpoint {}", tmp.display()))?;
            fs::rename(&tmp, &self.path)
                .with_context(|| format!("failed to replace checkpoint {}", self.path.display()))?;
            self.current = Some(next);
        }
        Ok(next)
    }

    pub fn remove(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove checkpoint {}", self.path.display()))?;
        }
        self.current = None;
        Ok(())
    }
}

fn read_txid(path: &Path) -> Result<Option<i64>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
    let txid = contents
        .split_whitespace()
        .next()
        .context("empty checkpoint file")?
        .parse::<i64>()
        .with_context(|| format!("invalid checkpoint contents in {}", path.display()))?;
    Ok(Some(txid))
}

/// The checkpoint directory must exist and be writable before startup.
pub fn validate_directory(directory: &Path) -> Result<()> {
    anyhow::ensure!(
        directory.is_dir(),
        "checkpoint directory {} does not exist",
        directory.display()
    );
    let probe = directory.join(".checkpoint_probe");
    fs::write(&probe, b"")
        .with_context(|| format!("checkpoint directory {} is not writable", directory.display()))?;
    fs::remove_file(&probe).ok();
    Ok(())
}
