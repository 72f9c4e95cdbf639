//! Recording muxer process management.
//!
//! The muxer (ffmpeg by default) reads the session description from
//! stdin and copies both RTP streams into a WebM container without
//! re-encoding. `launch` returns only after the full SDP has been
//! accepted on stdin, which is the readiness point callers gate stream
//! delivery on.

use crate::errors::SignalError;

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Lifecycle events emitted by the muxer monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerEvent {
    /// The process exited. `success` reflects its exit status.
    Exited { success: bool },
}

/// Handle to a running muxer process.
///
/// Dropping the handle without calling [`stop`](Self::stop) also
/// terminates the process: the monitor task kills the child when the
/// stop channel closes.
#[derive(Debug)]
pub struct FfmpegProcess {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl FfmpegProcess {
    /// OS pid of the child, when available.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the monitor task to kill and reap the child. The final
    /// [`MuxerEvent::Exited`] still arrives on the event channel.
    pub fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn the muxer and feed it the SDP.
///
/// Stream copy only; the container format is WebM. Returns the process
/// handle and the event channel once stdin has accepted the whole SDP.
///
/// # Errors
///
/// Returns [`SignalError::Recording`] when the binary cannot be spawned
/// or rejects the SDP on stdin.
pub async fn launch(
    bin: &str,
    sdp: &str,
    output: &Path,
) -> Result<(FfmpegProcess, mpsc::Receiver<MuxerEvent>), SignalError> {
    let mut child = Command::new(bin)
        .arg("-loglevel")
        .arg("debug")
        .arg("-protocol_whitelist")
        .arg("pipe,udp,rtp")
        .arg("-fflags")
        .arg("+genpts")
        .arg("-f")
        .arg("sdp")
        .arg("-i")
        .arg("pipe:0")
        .arg("-flags")
        .arg("+global_header")
        .arg("-map")
        .arg("0:v:0")
        .arg("-c:v")
        .arg("copy")
        .arg("-map")
        .arg("0:a:0")
        .arg("-c:a")
        .arg("copy")
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SignalError::Recording(format!("failed to spawn muxer '{bin}': {e}")))?;

    let pid = child.id();

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| SignalError::Recording("muxer stdin unavailable".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SignalError::Recording("muxer stderr unavailable".to_string()))?;

    // Readiness gate: return only once the muxer has the whole session
    // description. RTP sent before this point would hit closed ports.
    stdin
        .write_all(sdp.as_bytes())
        .await
        .map_err(|e| SignalError::Recording(format!("muxer rejected SDP on stdin: {e}")))?;
    stdin
        .shutdown()
        .await
        .map_err(|e| SignalError::Recording(format!("failed to close muxer stdin: {e}")))?;
    drop(stdin);

    let (stop_tx, stop_rx) = oneshot::channel();
    let (event_tx, event_rx) = mpsc::channel(4);

    tokio::spawn(monitor(child, stderr, stop_rx, event_tx));

    Ok((
        FfmpegProcess {
            pid,
            stop_tx: Some(stop_tx),
        },
        event_rx,
    ))
}

async fn monitor(
    mut child: tokio::process::Child,
    stderr: tokio::process::ChildStderr,
    mut stop_rx: oneshot::Receiver<()>,
    event_tx: mpsc::Sender<MuxerEvent>,
) {
    let pid = child.id();
    let mut lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            // Either an explicit stop or the handle being dropped.
            _ = &mut stop_rx => {
                debug!(target: "recording", ?pid, "stopping muxer");
                if let Err(e) = child.start_kill() {
                    warn!(target: "recording", ?pid, error = %e, "failed to signal muxer");
                }
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        debug!(target: "recording::muxer", ?pid, "{line}");
                    }
                    // stderr closed: the process is exiting on its own.
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }

    let success = match child.wait().await {
        Ok(status) => {
            debug!(target: "recording", ?pid, %status, "muxer exited");
            status.success()
        }
        Err(e) => {
            warn!(target: "recording", ?pid, error = %e, "failed to reap muxer");
            false
        }
    };

    let _ = event_tx.send(MuxerEvent::Exited { success }).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let result = launch(
            "/nonexistent/muxer-binary",
            "v=0\r\n",
            Path::new("/tmp/out.webm"),
        )
        .await;

        assert!(matches!(result, Err(SignalError::Recording(_))));
    }
}
