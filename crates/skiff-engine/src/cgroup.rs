use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::id::ObjectId;

/// Per-container resource limits, cgroup v2 model.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Legacy CPU share, converted to `cpu.weight`.
    pub cpu_share: u32,
    /// Memory ceiling in megabytes, written to `memory.max`.
    pub mem_limit_mb: u64,
}

impl Limits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            cpu_share: config.cpu_share,
            mem_limit_mb: config.mem_limit_mb,
        }
    }
}

/// Map a legacy CPU share onto the v2 weight range.
pub fn cpu_weight(share: u32) -> u32 {
    share * 10_000 / 1024
}

/// Memory ceiling in bytes as written to `memory.max`.
pub fn memory_max_bytes(mem_limit_mb: u64) -> u64 {
    mem_limit_mb * 1_000_000
}

/// True iff `name` appears in a space-separated controller list.
fn has_controller(list: &str, name: &str) -> bool {
    list.split_whitespace().any(|c| c == name)
}

/// A per-container cgroup directory under the engine-owned parent.
pub struct Cgroup {
    dir: PathBuf,
}

impl Cgroup {
    pub fn dir_for(parent: &Path, id: &ObjectId) -> PathBuf {
        parent.join(id.to_string())
    }

    /// The process list the container init writes itself into.
    pub fn procs_file(&self) -> PathBuf {
        self.dir.join("cgroup.procs")
    }

    /// Create the child cgroup and apply limits.
    ///
    /// Controller availability varies by kernel and delegation, so enabling
    /// controllers and writing limit files is best-effort: a container runs
    /// unconstrained on an axis rather than not at all. Creating the
    /// directory itself is not best-effort; the init process must be able
    /// to join.
    pub async fn create(parent: &Path, id: &ObjectId, limits: Limits) -> Result<Self> {
        tokio::fs::create_dir_all(parent).await?;
        enable_controllers(parent).await;

        let dir = Self::dir_for(parent, id);
        tokio::fs::create_dir_all(&dir).await?;

        let weight = cpu_weight(limits.cpu_share).to_string();
        write_limit(&dir.join("cpu.weight"), &weight).await;
        let max = memory_max_bytes(limits.mem_limit_mb).to_string();
        write_limit(&dir.join("memory.max"), &max).await;

        debug!(id = %id, cpu_weight = %weight, memory_max = %max, "cgroup ready");
        Ok(Self { dir })
    }

    /// Remove the cgroup for an ID if one exists, migrating any remaining
    /// processes up to the root cgroup first. Missing cgroup is a no-op.
    pub async fn remove(parent: &Path, id: &ObjectId) {
        let dir = Self::dir_for(parent, id);
        if !dir.exists() {
            return;
        }

        migrate_procs_to_root(&dir).await;

        if let Err(e) = tokio::fs::remove_dir(&dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to remove cgroup");
        } else {
            debug!(id = %id, "cgroup removed");
        }
    }
}

/// Enable the cpu and memory controllers in the parent's subtree where the
/// kernel offers them. Idempotent; absence is logged and tolerated.
async fn enable_controllers(parent: &Path) {
    let controllers = match tokio::fs::read_to_string(parent.join("cgroup.controllers")).await {
        Ok(c) => c,
        Err(e) => {
            warn!(parent = %parent.display(), error = %e, "cannot read cgroup.controllers");
            return;
        }
    };

    let subtree_path = parent.join("cgroup.subtree_control");
    let enabled = tokio::fs::read_to_string(&subtree_path)
        .await
        .unwrap_or_default();

    for controller in ["cpu", "memory"] {
        if !has_controller(&controllers, controller) {
            warn!(controller, "controller not available; limit will not apply");
            continue;
        }
        if has_controller(&enabled, controller) {
            continue;
        }
        if let Err(e) = tokio::fs::write(&subtree_path, format!("+{controller}")).await {
            warn!(controller, error = %e, "failed to enable controller");
        }
    }
}

async fn write_limit(path: &Path, value: &str) {
    if let Err(e) = tokio::fs::write(path, value).await {
        warn!(file = %path.display(), value, error = %e, "limit not applied");
    }
}

/// Move every PID listed in the child's process list into the root cgroup.
/// Best-effort; processes that already exited are gone from the list.
async fn migrate_procs_to_root(dir: &Path) {
    let procs = match tokio::fs::read_to_string(dir.join("cgroup.procs")).await {
        Ok(p) => p,
        Err(_) => return,
    };
    for pid in procs.split_whitespace() {
        if let Err(e) = tokio::fs::write("/sys/fs/cgroup/cgroup.procs", pid).await {
            warn!(pid, error = %e, "failed to migrate process to root cgroup");
        }
    }
}
