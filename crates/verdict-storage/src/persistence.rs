//! JSON snapshot persistence
//!
//! Snapshots are written to a sibling temp file and renamed into place so
//! a crash never leaves a half-written snapshot behind.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde_json::Value;
use tracing::debug;

pub fn load_snapshot(path: &Path) -> anyhow::Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("reading snapshot {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("parsing snapshot {}", path.display()))?;
    anyhow::ensure!(value.is_object(), "snapshot {} must hold a JSON object", path.display());
    debug!(path = %path.display(), "loaded snapshot");
    Ok(value)
}

pub fn save_snapshot(path: &Path, value: &Value) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("replacing snapshot {}", path.display()))?;
    debug!(path = %path.display(), "saved snapshot");
    Ok(())
}
