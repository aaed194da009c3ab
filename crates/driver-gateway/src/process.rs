//! External process execution with line streaming and cancellation.

use crate::error::DriverError;
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Output lines kept for error reporting
const TAIL_LINES: usize = 20;

/// Runs `command`, feeding each stdout/stderr line to `on_line` as it arrives.
///
/// Returns the combined output tail on success. A non-zero exit becomes
/// [`DriverError::Command`] carrying that tail; cancelling the token kills
/// the child and returns [`DriverError::Cancelled`].
pub async fn run_streaming<F>(mut command: Command, mut on_line: F, cancel: &CancellationToken) -> Result<String, DriverError>
where
    F: FnMut(&str),
{
    let shown = describe(&command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %shown, "Spawning driver process");
    let mut child = command.spawn()?;
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

    let mut record = |line: String, tail: &mut VecDeque<String>| {
        on_line(&line);
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(DriverError::Cancelled);
            }
            line = next_line(&mut stdout), if stdout.is_some() => match line? {
                Some(line) => record(line, &mut tail),
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line? {
                Some(line) => record(line, &mut tail),
                None => stderr = None,
            },
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(DriverError::Cancelled);
        }
        status = child.wait() => status?,
    };

    let output = Vec::from(tail).join("\n");
    if !status.success() {
        return Err(DriverError::Command {
            command: shown,
            message: if output.is_empty() { status.to_string() } else { output },
        });
    }
    Ok(output)
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

fn describe(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
