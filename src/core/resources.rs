//! Pre-stage resource checks.

use std::path::Path;

use tracing::debug;

use super::error::{io_kind, StageFailure};

const STEP: &str = "preflight";

/// Fail with `resource_exhaustion` when the volume holding `dir` has less
/// than `min_free_bytes` available. A minimum of zero disables the check.
pub fn check_disk(dir: &Path, min_free_bytes: u64) -> Result<(), StageFailure> {
    if min_free_bytes == 0 {
        return Ok(());
    }

    let available = fs2::available_space(dir)
        .map_err(|e| StageFailure::new(io_kind(&e), STEP, format!("cannot query free space: {}", e)))?;
    debug!(available, required = min_free_bytes, "Disk space check");

    if available < min_free_bytes {
        return Err(StageFailure::resources(
            STEP,
            format!(
                "only {} MiB free on {}, {} MiB required",
                available / (1024 * 1024),
                dir.display(),
                min_free_bytes / (1024 * 1024)
            ),
        ));
    }
    Ok(())
}
