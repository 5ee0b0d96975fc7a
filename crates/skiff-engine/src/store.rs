use std::path::{Path, PathBuf};

use tracing::debug;

use crate::command::{exec, exec_ignore_errors};
use crate::error::{EngineError, Result};

/// Copy-on-write subvolume store rooted at a mounted btrfs path.
///
/// Every image and container is a subvolume directly under the root; the
/// store owns subvolume contents and knows nothing about what they mean.
pub struct BtrfsStore {
    root: PathBuf,
}

impl BtrfsStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Absolute path of a named subvolume.
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// True iff a subvolume by exactly this name is listed under the root.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let names = self.list("").await?;
        Ok(names.iter().any(|n| n == name))
    }

    /// Create an empty subvolume. Fails if one already exists by that name.
    pub async fn create(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            return Err(EngineError::Exists(name.to_string()));
        }
        let path = self.path_string(name);
        exec("btrfs", &["subvolume", "create", &path]).await?;
        debug!(subvolume = name, "created");
        Ok(())
    }

    /// Copy the contents of `src_dir` into the named subvolume, preserving
    /// mode and reflinking where the filesystem supports it.
    pub async fn populate(&self, name: &str, src_dir: &Path) -> Result<()> {
        if !self.exists(name).await? {
            return Err(EngineError::not_found("subvolume", name));
        }
        // `/.` copies the directory contents, dotfiles included.
        let src = format!("{}/.", src_dir.display());
        let dst = self.path_string(name);
        exec("cp", &["-a", "--reflink=auto", &src, &dst]).await?;
        Ok(())
    }

    /// Create `dst` as a writable snapshot of `src`.
    pub async fn snapshot(&self, src: &str, dst: &str) -> Result<()> {
        if !self.exists(src).await? {
            return Err(EngineError::not_found("subvolume", src));
        }
        if self.exists(dst).await? {
            return Err(EngineError::Exists(dst.to_string()));
        }
        let src_path = self.path_string(src);
        let dst_path = self.path_string(dst);
        exec("btrfs", &["subvolume", "snapshot", &src_path, &dst_path]).await?;
        debug!(src, dst, "snapshotted");
        Ok(())
    }

    /// Remove a subvolume, including files created after a snapshot.
    pub async fn delete(&self, name: &str) -> Result<()> {
        if !self.exists(name).await? {
            return Err(EngineError::not_found("subvolume", name));
        }
        let path = self.path_string(name);
        exec("btrfs", &["subvolume", "delete", &path]).await?;
        debug!(subvolume = name, "deleted");
        Ok(())
    }

    /// Rename a subvolume in place. Plain rename; subvolumes are directories.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        tokio::fs::rename(self.path_of(from), self.path_of(to)).await?;
        Ok(())
    }

    /// Delete a subvolume on a cleanup path, ignoring failures.
    pub async fn delete_ignore_errors(&self, name: &str) {
        let path = self.path_string(name);
        exec_ignore_errors("btrfs", &["subvolume", "delete", &path]).await;
    }

    /// Names of subvolumes directly under the root whose names begin with
    /// `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root_string();
        let output = exec("btrfs", &["subvolume", "list", "-o", &root])
            .await
            .map_err(|e| {
                EngineError::Precondition(format!(
                    "{} is not a mounted btrfs root: {}",
                    self.root.display(),
                    e.detail
                ))
            })?;
        let mut names = parse_subvolume_names(&output);
        names.retain(|n| n.starts_with(prefix));
        names.sort_unstable();
        Ok(names)
    }

    fn root_string(&self) -> String {
        self.root.display().to_string()
    }

    fn path_string(&self, name: &str) -> String {
        self.path_of(name).display().to_string()
    }
}

/// Extract subvolume basenames from `btrfs subvolume list` output.
///
/// Lines look like `ID 257 gen 9 top level 256 path skiff/img_042`; the
/// path is relative to the filesystem root, so only its last component
/// names the subvolume.
fn parse_subvolume_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            words.find(|w| *w == "path")?;
            let path = words.next()?;
            let name = path.rsplit('/').next()?;
            Some(name.to_string())
        })
        .collect()
}
