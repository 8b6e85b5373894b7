//! Execution of external commands with a deadline.
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, info};
use tokio::process::Command;

use crate::error::SvnOperatorError;

/// Runs `program` with `args` and waits for it to exit.
///
/// Output is captured and logged whatever the outcome. If `timeout` elapses
/// first, the child is killed and [`SvnOperatorError::CommandTimeout`] is
/// returned; a nonzero exit status results in
/// [`SvnOperatorError::CommandFailed`].
pub async fn run_command<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    timeout: Option<Duration>,
) -> Result<(), SvnOperatorError> {
    let command_line = describe(program, args);
    debug!("Running command [{}]", command_line);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // Dropping the future on timeout drops the child, which kills it
    let output = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                error!(
                    "Command [{}] did not finish within {:?}, killed it",
                    command_line, timeout
                );
                return Err(SvnOperatorError::CommandTimeout {
                    command: command_line,
                    timeout,
                });
            }
        },
        None => child.wait_with_output().await?,
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    info!(
        "Command [{}] exited with {}; stdout: [{}] stderr: [{}]",
        command_line,
        output.status,
        stdout.trim_end(),
        stderr.trim_end()
    );

    if output.status.success() {
        Ok(())
    } else {
        Err(SvnOperatorError::CommandFailed {
            command: command_line,
            status: output.status,
            stdout,
            stderr,
        })
    }
}

fn describe<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(AsRef::as_ref))
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
