use std::path::Path;

use tracing::{info, warn};

use crate::attach;
use crate::cgroup::Cgroup;
use crate::command::require_tools;
use crate::config::EngineConfig;
use crate::container;
use crate::error::{EngineError, Result};
use crate::id::{ObjectId, ObjectKind};
use crate::image;
use crate::network;
use crate::paths::ContainerPaths;
use crate::registry;
use crate::store::BtrfsStore;

/// One listed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: ObjectId,
    pub source: String,
}

/// One listed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: ObjectId,
    pub command: String,
}

/// The engine facade: one instance per invocation, one method per
/// subcommand. Owns the configuration record and the snapshot store.
pub struct Engine {
    config: EngineConfig,
    store: BtrfsStore,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let store = BtrfsStore::new(config.root.clone());
        Self { config, store }
    }

    /// Create an image from a local directory tree.
    pub async fn init(&self, directory: &Path) -> Result<ObjectId> {
        require_tools(&["btrfs", "cp"])?;
        image::init(&self.config, &self.store, directory).await
    }

    /// Fetch and materialize a remote image.
    pub async fn pull(&self, name: &str, tag: &str) -> Result<ObjectId> {
        require_tools(&["btrfs", "cp"])?;
        registry::pull(&self.config, &self.store, name, tag).await
    }

    /// List images with their recorded origin.
    pub async fn images(&self) -> Result<Vec<ImageRecord>> {
        require_tools(&["btrfs"])?;
        let mut records = Vec::new();
        for name in self.store.list(ObjectKind::Image.prefix()).await? {
            let Some(id) = ObjectId::parse(&name) else {
                continue;
            };
            let source = image::source(&self.config, &id).await;
            records.push(ImageRecord { id, source });
        }
        Ok(records)
    }

    /// List containers with the command they were launched with.
    pub async fn containers(&self) -> Result<Vec<ContainerRecord>> {
        require_tools(&["btrfs"])?;
        let mut records = Vec::new();
        for name in self.store.list(ObjectKind::Container.prefix()).await? {
            let Some(id) = ObjectId::parse(&name) else {
                continue;
            };
            let paths = ContainerPaths::new(&self.config.root, &id);
            let command = tokio::fs::read_to_string(paths.cmd())
                .await
                .map(|c| c.trim_end().to_string())
                .unwrap_or_default();
            records.push(ContainerRecord { id, command });
        }
        Ok(records)
    }

    /// Create and run a container in the foreground.
    pub async fn run(&self, image_id: &str, cmd: &str) -> Result<ObjectId> {
        require_tools(&["btrfs", "ip", "unshare"])?;
        let image = parse_id(image_id, ObjectKind::Image)?;
        container::run(&self.config, &self.store, &image, cmd).await
    }

    /// Run a command inside a running container.
    pub async fn exec(&self, container_id: &str, argv: &[String]) -> Result<()> {
        require_tools(&["btrfs", "nsenter"])?;
        let id = parse_id(container_id, ObjectKind::Container)?;
        attach::exec(&self.config, &self.store, &id, argv).await
    }

    /// A container's captured output; empty when no log exists.
    pub async fn logs(&self, container_id: &str) -> Result<String> {
        let id = parse_id(container_id, ObjectKind::Container)?;
        if !self.store.exists(&id.to_string()).await? {
            return Err(EngineError::not_found("container", container_id));
        }
        let paths = ContainerPaths::new(&self.config.root, &id);
        Ok(tokio::fs::read_to_string(paths.log())
            .await
            .unwrap_or_default())
    }

    /// Replace an image with a container's current state.
    ///
    /// The container is snapshotted to a temporary sibling first and the
    /// swap happens by rename, so a failed snapshot leaves the image
    /// untouched.
    pub async fn commit(&self, container_id: &str, image_id: &str) -> Result<()> {
        require_tools(&["btrfs"])?;
        let container = parse_id(container_id, ObjectKind::Container)?;
        let image = parse_id(image_id, ObjectKind::Image)?;
        if !self.store.exists(&container.to_string()).await? {
            return Err(EngineError::not_found("container", container_id));
        }
        if !self.store.exists(&image.to_string()).await? {
            return Err(EngineError::not_found("image", image_id));
        }

        // `.tmp` is outside the identifier grammar, so the allocator can
        // never race onto it.
        let staged = commit_staging_name(&image);
        if self.store.exists(&staged).await? {
            warn!(name = %staged, "removing stale commit staging subvolume");
            self.store.delete(&staged).await?;
        }

        self.store.snapshot(&container.to_string(), &staged).await?;
        self.store.delete(&image.to_string()).await?;
        self.store.rename(&staged, &image.to_string()).await?;

        info!(%container, %image, "committed");
        Ok(())
    }

    /// Delete an image or container, along with a container's cgroup.
    pub async fn remove(&self, id: &str) -> Result<()> {
        require_tools(&["btrfs"])?;
        let parsed = ObjectId::parse(id)
            .ok_or_else(|| EngineError::not_found("image or container", id))?;
        if !self.store.exists(&parsed.to_string()).await? {
            return Err(EngineError::not_found(parsed.kind().label(), id));
        }

        self.store.delete(&parsed.to_string()).await?;
        if parsed.kind() == ObjectKind::Container {
            Cgroup::remove(&self.config.cgroup_parent, &parsed).await;
            // Recovers veth/netns leaked by an engine killed mid-run.
            network::teardown(&parsed).await;
        }
        info!(id, "removed");
        Ok(())
    }
}

fn parse_id(s: &str, kind: ObjectKind) -> Result<ObjectId> {
    ObjectId::parse(s)
        .filter(|id| id.kind() == kind)
        .ok_or_else(|| EngineError::not_found(kind.label(), s))
}

fn commit_staging_name(image: &ObjectId) -> String {
    format!("{image}.tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_enforces_the_kind() {
        assert!(parse_id("img_042", ObjectKind::Image).is_ok());
        assert!(parse_id("ps_042", ObjectKind::Container).is_ok());

        let err = parse_id("ps_042", ObjectKind::Image).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "image", .. }));

        let err = parse_id("img_042", ObjectKind::Container).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "container", .. }));
    }

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(parse_id("banana", ObjectKind::Image).is_err());
        assert!(parse_id("img_999", ObjectKind::Image).is_err());
    }

    #[test]
    fn commit_staging_name_is_outside_the_id_grammar() {
        let image = ObjectId::parse("img_100").unwrap();
        let staged = commit_staging_name(&image);
        assert_eq!(staged, "img_100.tmp");
        assert!(ObjectId::parse(&staged).is_none());
    }
}
