use std::path::PathBuf;

use nix::fcntl::{Flock, FlockArg};

use crate::error::{EngineError, Result};

/// Acquire an exclusive flock on the given path, blocking until available.
///
/// The returned guard holds the lock until dropped.
pub async fn acquire(path: PathBuf) -> Result<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                EngineError::Precondition(format!("open lock {}: {e}", path.display()))
            })?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, e)| {
            EngineError::Precondition(format!("flock {}: {e}", path.display()))
        })
    })
    .await
    .map_err(|e| EngineError::Precondition(format!("lock task: {e}")))?
}
