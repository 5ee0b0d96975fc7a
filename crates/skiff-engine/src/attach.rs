use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::id::ObjectId;
use crate::paths::ContainerPaths;
use crate::store::BtrfsStore;

/// Run a command inside a running container's namespace set.
///
/// The supervisor records its namespace-holder PID in `<id>.pid` at spawn
/// time; attach resolves the actual init (the holder's forked child),
/// verifies the process still matches the launch signature in case the PID
/// was recycled, and enters its namespaces via `nsenter`. The argv is
/// executed directly, without a shell.
pub async fn exec(
    config: &EngineConfig,
    store: &BtrfsStore,
    id: &ObjectId,
    argv: &[String],
) -> Result<()> {
    if !store.exists(&id.to_string()).await? {
        return Err(EngineError::not_found("container", &id.to_string()));
    }

    let rootfs = store.path_of(&id.to_string());
    let paths = ContainerPaths::new(&config.root, id);
    let init = find_init(&paths, &rootfs.display().to_string())
        .await
        .ok_or_else(|| EngineError::NotRunning(id.to_string()))?;

    info!(%id, init, "attaching");

    let mut command = Command::new("nsenter");
    command
        .arg("--target")
        .arg(init.to_string())
        .args(["--mount", "--uts", "--ipc", "--net", "--pid", "chroot"])
        .arg(&rootfs)
        .args(argv)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let status = command
        .status()
        .await
        .map_err(|e| EngineError::Kernel(format!("spawn nsenter: {e}")))?;

    match status.code() {
        Some(0) => {}
        Some(code) => warn!(%id, code, "attached command exited with failure"),
        None => warn!(%id, "attached command terminated by signal"),
    }
    Ok(())
}

/// Resolve the container's init PID, or `None` when it is not running.
///
/// A recorded PID can be stale two ways: the process exited (file left
/// behind by an engine crash), or it exited and the kernel recycled the
/// PID for something unrelated. The cmdline signature check catches both.
async fn find_init(paths: &ContainerPaths, rootfs: &str) -> Option<u32> {
    let recorded = tokio::fs::read_to_string(paths.pid()).await.ok()?;
    let holder: u32 = recorded.trim().parse().ok()?;

    let cmdline = tokio::fs::read(format!("/proc/{holder}/cmdline")).await.ok()?;
    if !is_supervisor_cmdline(&cmdline, rootfs) {
        return None;
    }

    // The holder forked the real init; it is the sole child.
    let children = tokio::fs::read_to_string(format!("/proc/{holder}/task/{holder}/children"))
        .await
        .ok()?;
    first_pid(&children)
}

/// True iff a `/proc/<pid>/cmdline` blob looks like the supervisor's
/// `unshare ... chroot <rootfs> ...` invocation for this container.
fn is_supervisor_cmdline(cmdline: &[u8], rootfs: &str) -> bool {
    let mut args = cmdline
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy);

    let is_unshare = args
        .next()
        .is_some_and(|argv0| argv0.rsplit('/').next() == Some("unshare"));
    is_unshare && args.any(|arg| arg == rootfs)
}

fn first_pid(children: &str) -> Option<u32> {
    children.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_cmdline_matches_unshare_with_this_rootfs() {
        let cmdline = b"unshare\0--mount\0--uts\0--ipc\0--pid\0--fork\0--mount-proc\0chroot\0/var/skiff/ps_042\0/bin/sh\0-c\0sleep 60\0";
        assert!(is_supervisor_cmdline(cmdline, "/var/skiff/ps_042"));
    }

    #[test]
    fn absolute_unshare_paths_match() {
        let cmdline = b"/usr/bin/unshare\0--fork\0chroot\0/var/skiff/ps_100\0/bin/sh\0";
        assert!(is_supervisor_cmdline(cmdline, "/var/skiff/ps_100"));
    }

    #[test]
    fn other_containers_do_not_match() {
        let cmdline = b"unshare\0--fork\0chroot\0/var/skiff/ps_100\0/bin/sh\0";
        assert!(!is_supervisor_cmdline(cmdline, "/var/skiff/ps_042"));
    }

    #[test]
    fn recycled_pids_do_not_match() {
        let cmdline = b"nginx\0-g\0daemon off;\0";
        assert!(!is_supervisor_cmdline(cmdline, "/var/skiff/ps_042"));
    }

    #[test]
    fn empty_cmdline_does_not_match() {
        // Kernel threads expose an empty cmdline.
        assert!(!is_supervisor_cmdline(b"", "/var/skiff/ps_042"));
    }

    #[test]
    fn first_pid_reads_the_children_list() {
        assert_eq!(first_pid("4242 4243 4244\n"), Some(4242));
        assert_eq!(first_pid("4242"), Some(4242));
    }

    #[test]
    fn empty_children_list_means_init_died() {
        assert_eq!(first_pid(""), None);
        assert_eq!(first_pid("\n"), None);
    }
}
