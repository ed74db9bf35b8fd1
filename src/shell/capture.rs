//! Shell-state capture inside a pseudo-terminal
//!
//! The probe runs as `<shell> -l -i -c <probe>` so the user's startup files
//! shape the captured state. Reading happens on a blocking thread; on
//! timeout the child is killed.

use std::io::Read;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, warn};

use super::state::{ShellState, ShellStateError};
use super::{parse_probe_output, ShellType};

/// Capture the local user's login shell.
pub async fn capture_local(timeout: Duration) -> Result<ShellState, ShellStateError> {
    capture(ShellType::detect_local().await, timeout).await
}

/// Run the dialect's probe and parse its output.
pub async fn capture(
    shell_type: ShellType,
    timeout: Duration,
) -> Result<ShellState, ShellStateError> {
    if !shell_type.is_available() {
        return Err(ShellStateError::Capture(format!(
            "{} not found on PATH",
            shell_type.program()
        )));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: crate::config::settings::DEFAULT_TERM_ROWS,
            cols: crate::config::settings::DEFAULT_TERM_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| ShellStateError::Capture(format!("openpty: {}", e)))?;

    let mut cmd = CommandBuilder::new(shell_type.program());
    cmd.args(["-l", "-i", "-c"]);
    cmd.arg(shell_type.probe_script());
    cmd.env("TERM", crate::config::settings::DEFAULT_TERM);
    if let Some(home) = dirs::home_dir() {
        cmd.cwd(home);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| ShellStateError::Capture(format!("spawn {}: {}", shell_type, e)))?;
    drop(pair.slave);

    let mut killer = child.clone_killer();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| ShellStateError::Capture(format!("pty reader: {}", e)))?;

    let read_task = tokio::task::spawn_blocking(move || {
        let mut output = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                // EIO once the slave side closes
                Err(_) => break,
            }
        }
        let status = child.wait();
        (output, status)
    });

    let (output, status) = match tokio::time::timeout(timeout, read_task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(ShellStateError::Capture(format!("join: {}", e))),
        Err(_) => {
            warn!("[shell-state] {} probe timed out, killing", shell_type);
            let _ = killer.kill();
            return Err(ShellStateError::Timeout(timeout.as_secs()));
        }
    };
    drop(pair.master);

    match status {
        Ok(status) if !status.success() => {
            debug!("[shell-state] {} probe exited with {:?}", shell_type, status)
        }
        Err(e) => debug!("[shell-state] wait failed: {}", e),
        _ => {}
    }

    let state = parse_probe_output(shell_type, &output)?;
    debug!(
        "[shell-state] Captured {} declarations (cwd {})",
        state.decls.len(),
        state.cwd
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_shell_is_reported_before_spawning() {
        if ShellType::Zsh.is_available() {
            return;
        }
        let err = capture(ShellType::Zsh, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.to_string(), "shell state capture failed: zsh not found on PATH");
    }

    #[tokio::test]
    async fn test_capture_bash_when_available() {
        if !ShellType::Bash.is_available() {
            return;
        }
        match capture(ShellType::Bash, Duration::from_secs(10)).await {
            Ok(state) => {
                assert_eq!(state.shell_type, ShellType::Bash);
                assert!(!state.cwd.is_empty());
                assert!(state.decls.contains_key("PROMPTVAR_GITBRANCH"));
            }
            // sandboxes without a usable pty
            Err(ShellStateError::Capture(_)) | Err(ShellStateError::Timeout(_)) => {}
            Err(e) => panic!("unexpected capture error: {}", e),
        }
    }
}
