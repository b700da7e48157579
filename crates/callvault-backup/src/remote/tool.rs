//! External transfer tool invocation shared by the command-line transports

use std::{ffi::OsStr, process::Stdio};

use tokio::process::Command;
use tracing::debug;

use crate::error::RemoteError;

/// stderr fragments that mean retrying cannot help
const PERMANENT_MARKERS: &[&str] = &[
    "permission denied",
    "access denied",
    "accessdenied",
    "login incorrect",
    "530 ",
    "authentication failed",
    "invalidaccesskeyid",
    "signaturedoesnotmatch",
    "nosuchbucket",
    "quota",
    "no space left",
    "552 ",
    "host key verification failed",
];

/// Decide whether a failed tool invocation is worth retrying
pub(crate) fn classify_failure(tool: &str, code: Option<i32>, stderr: &str) -> RemoteError {
    let lowered = stderr.to_lowercase();
    let message = format!(
        "{} exited with {}: {}",
        tool,
        code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
        stderr.trim()
    );
    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        RemoteError::Permanent(message)
    } else {
        RemoteError::Transient(message)
    }
}

/// Run a tool to completion and return its stdout
pub(crate) async fn run<I, S>(
    program: &str,
    args: I,
    envs: &[(&str, &str)],
) -> Result<String, RemoteError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    debug!("🔧 Running {}", program);

    let output = match cmd.output().await {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RemoteError::Permanent(format!("{program} not found in PATH")));
        }
        Err(e) => return Err(RemoteError::from_io(&e)),
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(classify_failure(
            program,
            output.status.code(),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Parse `<name> <size>` lines into remote files
pub(crate) fn parse_name_size_lines(stdout: &str) -> Vec<super::RemoteFile> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let first = parts.next()?;
            let second = parts.next();
            Some(match second {
                Some(size) => super::RemoteFile {
                    name: first.to_string(),
                    size_bytes: size.parse().ok(),
                },
                None => super::RemoteFile {
                    name: first.to_string(),
                    size_bytes: None,
                },
            })
        })
        .collect()
}
