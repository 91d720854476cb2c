//! Subprocess helper shared by the device and network plumbing.

use firesnap_common::{Error, Result};
use tokio::process::Command;
use tracing::debug;

/// Run a command to completion, mapping a non-zero exit into a typed error
/// that carries the full command line and the trimmed stderr.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<()> {
    let command_line = format!("{program} {}", args.join(" "));
    debug!(command = %command_line, "running");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::command(&command_line, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::command(
            &command_line,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(())
}
