//! Working directory for downloaded inputs and generated outputs.

use std::path::{Path, PathBuf};

const INPUT_PREFIX: &str = "input_";
const OUTPUT_PREFIX: &str = "output_";

/// Create `dir` if needed and delete job files left over from a previous
/// run. Returns how many files were removed.
pub async fn prepare(dir: &Path) -> std::io::Result<usize> {
    tokio::fs::create_dir_all(dir).await?;

    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.starts_with(INPUT_PREFIX) || name.starts_with(OUTPUT_PREFIX)) {
            continue;
        }
        if !entry.file_type().await?.is_file() {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove stale file"),
        }
    }

    if removed > 0 {
        tracing::info!(removed, dir = %dir.display(), "Removed stale job files");
    }
    Ok(removed)
}

/// Fresh path for a downloaded input image.
pub fn input_path(dir: &Path) -> PathBuf {
    dir.join(format!("{INPUT_PREFIX}{}.jpg", uuid::Uuid::new_v4()))
}
