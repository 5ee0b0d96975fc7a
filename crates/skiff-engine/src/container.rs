use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::cgroup::{Cgroup, Limits};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::id::{self, ObjectId, ObjectKind};
use crate::network;
use crate::paths::{ContainerPaths, NETNS_RUN_DIR};
use crate::store::BtrfsStore;

/// Create and run a container from an image in the foreground.
///
/// Setup order is load-bearing: the network fabric exists before the
/// snapshot, and the child joins its cgroup and network namespace before
/// any other namespace is created, so the init process and all its
/// descendants are accounted and connected.
///
/// The payload's exit status is reported but is never an engine error; the
/// snapshot, log, cmd file, and cgroup persist after exit, while the veth
/// pair and namespace are always torn down.
pub async fn run(
    config: &EngineConfig,
    store: &BtrfsStore,
    image: &ObjectId,
    cmd: &str,
) -> Result<ObjectId> {
    // Pre-mutation validation: nothing is built for an unknown image.
    if !store.exists(&image.to_string()).await? {
        return Err(EngineError::not_found("image", &image.to_string()));
    }

    let id = id::allocate(ObjectKind::Container, store).await?;
    info!(%id, %image, %cmd, "starting container");

    network::setup(config, &id).await?;

    let result = provision_and_run(config, store, image, &id, cmd).await;

    // The fabric lives exactly as long as the init process, success or not.
    network::teardown(&id).await;

    if let Err(e) = result {
        // Reverse-order teardown of what provisioning built.
        Cgroup::remove(&config.cgroup_parent, &id).await;
        store.delete_ignore_errors(&id.to_string()).await;
        return Err(e);
    }

    info!(%id, "container exited");
    Ok(id)
}

async fn provision_and_run(
    config: &EngineConfig,
    store: &BtrfsStore,
    image: &ObjectId,
    id: &ObjectId,
    cmd: &str,
) -> Result<()> {
    store.snapshot(&image.to_string(), &id.to_string()).await?;

    let paths = ContainerPaths::new(&config.root, id);
    write_resolv_conf(&paths, &config.nameserver).await?;
    tokio::fs::write(paths.cmd(), format!("{cmd}\n")).await?;

    let cgroup = Cgroup::create(&config.cgroup_parent, id, Limits::from_config(config)).await?;

    let mut child = spawn_init(store, id, cmd, cgroup.procs_file())?;

    if let Some(pid) = child.id() {
        tokio::fs::write(paths.pid(), pid.to_string()).await?;
    }

    let status = supervise(&mut child, &paths).await;

    // Stopped: the recorded PID is no longer meaningful.
    if let Err(e) = tokio::fs::remove_file(paths.pid()).await {
        warn!(%id, error = %e, "failed to remove pid file");
    }

    match status?.code() {
        Some(0) => info!(%id, "payload exited cleanly"),
        Some(code) => warn!(%id, code, "payload exited with failure"),
        None => warn!(%id, "payload terminated by signal"),
    }
    Ok(())
}

async fn write_resolv_conf(paths: &ContainerPaths, nameserver: &str) -> Result<()> {
    let resolv = paths.resolv_conf();
    if let Some(etc) = resolv.parent() {
        tokio::fs::create_dir_all(etc).await?;
    }
    tokio::fs::write(&resolv, format!("nameserver {nameserver}\n")).await?;
    Ok(())
}

/// Spawn the container init: `unshare` holding fresh mount/UTS/IPC/PID
/// namespaces around a chrooted shell that remounts /proc and runs the
/// payload.
///
/// A pre-exec hook in the forked child writes its PID into the container
/// cgroup and then enters the named network namespace, strictly before
/// `unshare` creates the remaining namespaces. Either hook step failing
/// fails the spawn, which the caller treats as a hard error.
fn spawn_init(
    store: &BtrfsStore,
    id: &ObjectId,
    cmd: &str,
    cgroup_procs: PathBuf,
) -> Result<Child> {
    let rootfs = store.path_of(&id.to_string());
    let netns_file = Path::new(NETNS_RUN_DIR).join(network::netns_name(id));
    let shell_line = format!("/bin/mount -t proc proc /proc && {cmd}");

    let mut command = Command::new("unshare");
    command
        .args(["--mount", "--uts", "--ipc", "--pid", "--fork", "--mount-proc", "chroot"])
        .arg(&rootfs)
        .args(["/bin/sh", "-c"])
        .arg(&shell_line)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    unsafe {
        command.pre_exec(move || {
            join_cgroup(&cgroup_procs)?;
            enter_netns(&netns_file)?;
            Ok(())
        });
    }

    command
        .spawn()
        .map_err(|e| EngineError::Kernel(format!("spawn container init: {e}")))
}

/// Runs in the forked child: join the container cgroup so every descendant
/// is accounted.
fn join_cgroup(procs_file: &Path) -> std::io::Result<()> {
    std::fs::write(procs_file, std::process::id().to_string())
}

/// Runs in the forked child: enter the container's network namespace so
/// the init inherits its interfaces.
fn enter_netns(netns_file: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(netns_file)?;
    nix::sched::setns(&file, nix::sched::CloneFlags::CLONE_NEWNET)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

/// Fan the child's combined output out to the container log and the
/// caller's terminal, then reap it.
async fn supervise(child: &mut Child, paths: &ContainerPaths) -> Result<std::process::ExitStatus> {
    let stdout_task = child.stdout.take().map(|stream| {
        let log = paths.log();
        tokio::spawn(async move { tee(stream, &log, tokio::io::stdout()).await })
    });
    let stderr_task = child.stderr.take().map(|stream| {
        let log = paths.log();
        tokio::spawn(async move { tee(stream, &log, tokio::io::stderr()).await })
    });

    let status = child
        .wait()
        .await
        .map_err(|e| EngineError::Kernel(format!("wait for container init: {e}")))?;

    for task in [stdout_task, stderr_task].into_iter().flatten() {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "log capture ended early"),
            Err(e) => warn!(error = %e, "log capture task failed"),
            Ok(Ok(())) => {}
        }
    }

    Ok(status)
}

/// Copy `src` to the log file and a terminal stream until EOF.
async fn tee<R, W>(mut src: R, log_path: &Path, mut mirror: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;

    let mut buf = [0u8; 8192];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(chunk) = buf.get(..n) {
            log.write_all(chunk).await?;
            mirror.write_all(chunk).await?;
            mirror.flush().await?;
        }
    }
    log.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tee_copies_bytes_to_both_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("out.log");
        let mut mirror = Vec::new();

        tee(&b"hello\nworld\n"[..], &log_path, &mut mirror)
            .await
            .unwrap();

        assert_eq!(mirror, b"hello\nworld\n");
        let logged = tokio::fs::read(&log_path).await.unwrap();
        assert_eq!(logged, b"hello\nworld\n");
    }

    #[tokio::test]
    async fn tee_appends_across_calls() {
        // stdout and stderr share one log file; append keeps both.
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("out.log");

        tee(&b"out"[..], &log_path, &mut Vec::new()).await.unwrap();
        tee(&b"err"[..], &log_path, &mut Vec::new()).await.unwrap();

        let logged = tokio::fs::read_to_string(&log_path).await.unwrap();
        assert_eq!(logged, "outerr");
    }

    #[tokio::test]
    async fn tee_preserves_binary_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("out.log");
        let payload: Vec<u8> = (0u8..=255).collect();
        let mut mirror = Vec::new();

        tee(payload.as_slice(), &log_path, &mut mirror).await.unwrap();

        assert_eq!(mirror, payload);
        assert_eq!(tokio::fs::read(&log_path).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn resolv_conf_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let id = ObjectId::parse("ps_042").unwrap();
        let container_dir = dir.path().join("ps_042");
        tokio::fs::create_dir_all(container_dir.join("etc")).await.unwrap();
        tokio::fs::write(container_dir.join("etc/resolv.conf"), "nameserver 1.1.1.1\n")
            .await
            .unwrap();

        let paths = ContainerPaths::new(dir.path(), &id);
        write_resolv_conf(&paths, "8.8.8.8").await.unwrap();

        let content = tokio::fs::read_to_string(container_dir.join("etc/resolv.conf"))
            .await
            .unwrap();
        assert_eq!(content, "nameserver 8.8.8.8\n");
    }

    #[tokio::test]
    async fn resolv_conf_creates_etc_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let id = ObjectId::parse("ps_100").unwrap();
        tokio::fs::create_dir_all(dir.path().join("ps_100")).await.unwrap();

        let paths = ContainerPaths::new(dir.path(), &id);
        write_resolv_conf(&paths, "9.9.9.9").await.unwrap();

        let content = tokio::fs::read_to_string(dir.path().join("ps_100/etc/resolv.conf"))
            .await
            .unwrap();
        assert_eq!(content, "nameserver 9.9.9.9\n");
    }
}
