//! Bounded execution of external command-line tools.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use harvester_shared::{HarvesterError, Result};

/// Captured output of a finished tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Combined stdout then stderr, lossily decoded.
    pub output: String,
}

/// Run `program args...` to completion within `timeout`.
///
/// A missing executable, a timeout, and a non-zero exit are all reported as
/// [`HarvesterError::Tool`]. The child is killed if the timeout elapses.
pub async fn run_tool(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<ToolOutput> {
    debug!(program, ?args, "running tool");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HarvesterError::Tool(format!("`{program}` not found. Is it installed and on PATH?"))
        } else {
            HarvesterError::Tool(format!("failed to spawn `{program}`: {e}"))
        }
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            HarvesterError::Tool(format!("`{program}` timed out after {}s", timeout.as_secs()))
        })?
        .map_err(|e| HarvesterError::Tool(format!("`{program}` wait failed: {e}")))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        return Err(HarvesterError::Tool(format!(
            "`{program}` exited with code {code}: {}",
            tail(&text, 3)
        )));
    }

    Ok(ToolOutput { output: text })
}

/// Last `n` non-empty lines of `text`, joined with ` | `.
fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}
