use tokio::process::Command;
use tracing::trace;

use crate::error::{EngineError, Result};

/// Error from a failed external command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

fn display_line(program: &str, args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Run an external tool and return its trimmed stdout.
///
/// The program is invoked directly with an argv vector; nothing is ever
/// passed through a shell.
pub async fn exec(program: &str, args: &[&str]) -> std::result::Result<String, CommandError> {
    let line = display_line(program, args);
    trace!(command = %line, "exec");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| CommandError {
            command: line.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: line,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run an external tool on a cleanup path, logging failures instead of
/// surfacing them.
pub async fn exec_ignore_errors(program: &str, args: &[&str]) {
    if let Err(e) = exec(program, args).await {
        trace!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}

/// Verify that every named tool resolves on `PATH`.
pub fn require_tools(tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Precondition(format!(
            "required tools missing from PATH: {}",
            missing.join(", ")
        )))
    }
}
