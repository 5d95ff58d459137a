//! Host-side probe commands.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::HttpProbeError;

/// Upper bound for one host probe command.
pub const HOST_EXEC_TIMEOUT: Duration = Duration::from_secs(200);

/// Runs `command` on the host, splitting it with shell word rules.
///
/// Output goes straight to the host terminal. Stdin stays with the
/// continue-after `enter` mode. A non-zero exit status, a spawn failure or
/// the timeout are errors.
pub async fn run_host_probe(command: &str, timeout: Duration) -> Result<(), HttpProbeError> {
    let fail = |reason: String| HttpProbeError::HostExec {
        command: command.to_owned(),
        reason,
    };

    let argv = shlex::split(command).ok_or_else(|| fail("unbalanced quotes".to_owned()))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| fail("empty command".to_owned()))?;

    debug!(program = %program, args = ?args, "running host probe");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| fail(e.to_string()))?;

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map_err(|e| fail(e.to_string()))?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(fail(format!("timed out after {}s", timeout.as_secs())));
        }
    };

    if status.success() {
        Ok(())
    } else {
        Err(fail(status.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command() {
        run_host_probe("sh -c 'exit 0'", HOST_EXEC_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = run_host_probe("sh -c \"exit 3\"", HOST_EXEC_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpProbeError::HostExec { .. }));
        assert!(err.to_string().contains('3'));
    }

    #[tokio::test]
    async fn unparsable_or_empty_commands_fail() {
        assert!(run_host_probe("sh -c 'oops", HOST_EXEC_TIMEOUT).await.is_err());
        assert!(run_host_probe("   ", HOST_EXEC_TIMEOUT).await.is_err());
        assert!(
            run_host_probe("/nonexistent/probe-tool --check", HOST_EXEC_TIMEOUT)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn commands_see_an_empty_stdin() {
        run_host_probe(
            "sh -c 'if read line; then exit 1; fi'",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run_host_probe("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
