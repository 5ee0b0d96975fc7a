use std::path::Path;

use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::id::{self, ObjectId, ObjectKind};
use crate::paths::ImagePaths;
use crate::store::BtrfsStore;

/// Create an image from a local directory tree.
///
/// The tree is copied (reflinked where possible) into a fresh subvolume.
/// An `img.source` already present in the tree is kept, since the pull
/// pipeline pre-seeds it with the `name:tag` reference; otherwise the
/// source directory's absolute path is recorded.
pub async fn init(config: &EngineConfig, store: &BtrfsStore, src_dir: &Path) -> Result<ObjectId> {
    let meta = tokio::fs::metadata(src_dir).await.map_err(|_| {
        EngineError::Precondition(format!("{} is not a directory", src_dir.display()))
    })?;
    if !meta.is_dir() {
        return Err(EngineError::Precondition(format!(
            "{} is not a directory",
            src_dir.display()
        )));
    }

    let id = id::allocate(ObjectKind::Image, store).await?;
    store.create(&id.to_string()).await?;

    let result = populate(config, store, &id, src_dir).await;
    if result.is_err() {
        store.delete_ignore_errors(&id.to_string()).await;
    }
    result?;

    info!(%id, src = %src_dir.display(), "image created");
    Ok(id)
}

async fn populate(
    config: &EngineConfig,
    store: &BtrfsStore,
    id: &ObjectId,
    src_dir: &Path,
) -> Result<()> {
    store.populate(&id.to_string(), src_dir).await?;

    let source_file = ImagePaths::new(&config.root, id).source();
    if !tokio::fs::try_exists(&source_file).await? {
        let origin = tokio::fs::canonicalize(src_dir).await?;
        tokio::fs::write(&source_file, origin.display().to_string()).await?;
    }
    Ok(())
}

/// Read an image's recorded origin; empty when the record is missing.
pub async fn source(config: &EngineConfig, id: &ObjectId) -> String {
    let source_file = ImagePaths::new(&config.root, id).source();
    tokio::fs::read_to_string(&source_file)
        .await
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}
