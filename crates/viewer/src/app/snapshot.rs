use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use shell::{SnapshotSaver, TickError};
use tracing::info;

use super::grid::LoopbackGrid;

pub(crate) const SNAPSHOT_FILE_NAME: &str = "last_session.json";

/// Writes the session summary as JSON into the cache directory.
pub(crate) struct SessionSnapshotWriter {
    path: PathBuf,
    grid: LoopbackGrid,
}

impl SessionSnapshotWriter {
    pub(crate) fn new(cache_dir: &Path, grid: LoopbackGrid) -> Self {
        Self {
            path: cache_dir.join(SNAPSHOT_FILE_NAME),
            grid,
        }
    }
}

impl SnapshotSaver for SessionSnapshotWriter {
    fn save_final_snapshot(&mut self) -> Result<(), TickError> {
        let summary = self.grid.summary();
        let text = serde_json::to_string_pretty(&summary)
            .map_err(|err| TickError::continuable("final_snapshot", err.to_string()))?;
        write_text_atomic(&self.path, &text).map_err(|err| {
            TickError::continuable(
                "final_snapshot",
                format!("failed to write {}: {err}", self.path.display()),
            )
        })?;
        info!(path = %self.path.display(), "final_snapshot_saved");
        Ok(())
    }
}

fn write_text_atomic(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, text)?;
    if let Err(error) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(SNAPSHOT_FILE_NAME);
    let tmp_name = format!("{file_name}.tmp");
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}
