use std::path::{Path, PathBuf};

use crate::id::ObjectId;

/// Name of the origin record inside an image subvolume.
pub const SOURCE_FILE: &str = "img.source";

/// Directory where `ip netns add` materializes named namespaces.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Lock file guarding identifier allocation across invocations.
pub const ID_LOCK_FILE: &str = "/var/lock/skiff-id.lock";

/// Paths inside an image subvolume.
pub struct ImagePaths {
    dir: PathBuf,
}

impl ImagePaths {
    pub fn new(root: &Path, id: &ObjectId) -> Self {
        Self {
            dir: root.join(id.to_string()),
        }
    }

    /// `<root>/<id>/img.source`
    pub fn source(&self) -> PathBuf {
        self.dir.join(SOURCE_FILE)
    }
}

/// Paths inside a container subvolume.
pub struct ContainerPaths {
    dir: PathBuf,
    id: String,
}

impl ContainerPaths {
    pub fn new(root: &Path, id: &ObjectId) -> Self {
        let id = id.to_string();
        Self {
            dir: root.join(&id),
            id,
        }
    }

    /// `<root>/<id>/etc/resolv.conf`
    pub fn resolv_conf(&self) -> PathBuf {
        self.dir.join("etc").join("resolv.conf")
    }

    /// `<root>/<id>/<id>.cmd`
    pub fn cmd(&self) -> PathBuf {
        self.dir.join(format!("{}.cmd", self.id))
    }

    /// `<root>/<id>/<id>.log`
    pub fn log(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.id))
    }

    /// `<root>/<id>/<id>.pid`
    pub fn pid(&self) -> PathBuf {
        self.dir.join(format!("{}.pid", self.id))
    }
}
