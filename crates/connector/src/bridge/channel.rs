//! Process channel - owns the helper process and its line-oriented pipes.
//!
//! Flow:
//! 1. Spawn the helper with piped stdin/stdout and inherited stderr
//! 2. A writer task drains outbound lines into stdin (unbounded buffering)
//! 3. The event loop routes inbound lines to the correlator and commands to the writer
//! 4. On stdout EOF or process exit: reject everything still pending, reap the
//!    child, report closed

use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::LineCodec;
use super::correlator::{Correlator, Dispatch, PendingReply};
use super::protocol::RequestError;
use crate::install::ResolvedPath;
use crate::platform::ExecMode;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different helper spawn strategies.
///
/// The returned child must have piped stdin and stdout.
pub trait HelperSpawner: Send + Sync {
    fn spawn(&self, helper: &ResolvedPath, env: &[(String, String)]) -> Result<Child, SpawnError>;
}

/// Arguments for `cmd.exe`: no AutoRun, and the quoted path taken verbatim so
/// spaces and `&` survive.
#[cfg_attr(not(windows), allow(dead_code))]
fn shell_command_line(path: &Path) -> OsString {
    let mut line = OsString::from("/d /s /c \"");
    line.push(path);
    line.push("\"");
    line
}

/// Spawns helpers as plain OS processes.
///
/// The parent environment is inherited; `env` is layered on top. Shell mode
/// runs the helper through `cmd /d /s /c` without a console window.
pub struct CommandSpawner;

impl HelperSpawner for CommandSpawner {
    fn spawn(&self, helper: &ResolvedPath, env: &[(String, String)]) -> Result<Child, SpawnError> {
        let mut command = match helper.mode {
            ExecMode::Direct => Command::new(&helper.path),
            ExecMode::Shell => {
                let shell =
                    std::env::var_os("ComSpec").unwrap_or_else(|| OsString::from("cmd.exe"));
                let mut command = Command::new(shell);
                #[cfg(windows)]
                command.raw_arg(shell_command_line(&helper.path));
                #[cfg(not(windows))]
                command.arg("/C").arg(&helper.path);
                command
            }
        };

        command
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = command.spawn()?;
        tracing::info!(
            path = %helper.path.display(),
            mode = ?helper.mode,
            pid = ?child.id(),
            "Spawned helper process"
        );
        Ok(child)
    }
}

/// Messages from bridge handles to the event loop.
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    Request { line: String, reply: PendingReply },
    End,
}

/// Caller-side handle to a running event loop.
#[derive(Debug, Clone)]
pub(crate) struct ChannelHandle {
    pub commands: mpsc::UnboundedSender<ChannelCommand>,
    pub closed: watch::Receiver<bool>,
}

/// Start the event loop over an inbound/outbound pipe pair.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub(crate) fn start<R, W>(
    reader: R,
    writer: W,
    child: Option<Child>,
    correlator: Box<dyn Correlator>,
    label: String,
) -> ChannelHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let (lines_tx, lines_rx) = mpsc::unbounded_channel();

    let writer = FramedWrite::new(writer, LineCodec::new());
    let reader = FramedRead::new(reader, LineCodec::new());

    tokio::spawn(run_writer(writer, lines_rx, label.clone()));
    tokio::spawn(run_event_loop(
        reader,
        lines_tx,
        commands_rx,
        correlator,
        child,
        closed_tx,
        label,
    ));

    ChannelHandle {
        commands: commands_tx,
        closed: closed_rx,
    }
}

/// Write queued lines to the helper, then close its input.
///
/// Runs apart from the event loop so a helper that stops reading can never
/// stall delivery of its replies.
async fn run_writer<W>(
    mut writer: FramedWrite<W, LineCodec>,
    mut lines: mpsc::UnboundedReceiver<String>,
    label: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.send(line).await {
            tracing::warn!(helper = %label, error = %e, "Failed to write to helper");
            return;
        }
    }

    if let Err(e) = writer.close().await {
        tracing::debug!(helper = %label, error = %e, "Failed to close helper input");
    }
    tracing::debug!(helper = %label, "Helper input closed");
}

/// How long buffered output is still read after the helper process exits.
const EXIT_GRACE: Duration = Duration::from_millis(100);

fn dispatch(correlator: &mut dyn Correlator, line: &str, label: &str) {
    match correlator.on_line(line) {
        Dispatch::Delivered => {
            tracing::trace!(helper = %label, pending = correlator.pending(), "Delivered response");
        }
        Dispatch::Abandoned => {
            tracing::debug!(helper = %label, "Discarded response for abandoned request");
        }
        Dispatch::Orphaned => {
            tracing::warn!(
                helper = %label,
                %line,
                "Received line with no pending request (helper out of sync?)"
            );
        }
    }
}

/// Resolves when the child exits; never resolves without one.
async fn wait_child(child: &mut Option<Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

fn log_exit(label: &str, result: std::io::Result<ExitStatus>) {
    match result {
        Ok(status) if status.success() => {
            tracing::info!(helper = %label, %status, "Helper exited");
        }
        Ok(status) => {
            tracing::warn!(helper = %label, %status, "Helper exited unsuccessfully");
        }
        Err(e) => {
            tracing::warn!(helper = %label, error = %e, "Failed to wait for helper");
        }
    }
}

async fn run_event_loop<R>(
    mut reader: FramedRead<R, LineCodec>,
    lines_tx: mpsc::UnboundedSender<String>,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    mut correlator: Box<dyn Correlator>,
    mut child: Option<Child>,
    closed_tx: watch::Sender<bool>,
    label: String,
) where
    R: AsyncRead + Unpin,
{
    let mut lines_tx = Some(lines_tx);
    let mut commands_open = true;
    let mut exit = None;

    loop {
        tokio::select! {
            biased;

            frame = reader.next() => {
                match frame {
                    Some(Ok(line)) => dispatch(correlator.as_mut(), &line, &label),
                    Some(Err(e)) => {
                        tracing::error!(helper = %label, error = %e, "Helper output error");
                        break;
                    }
                    None => {
                        tracing::debug!(helper = %label, "Helper output closed");
                        break;
                    }
                }
            }

            command = commands.recv(), if commands_open => {
                match command {
                    Some(ChannelCommand::Request { line, reply }) => {
                        let sent = match lines_tx.as_ref() {
                            Some(tx) => tx.send(line).is_ok(),
                            None => false,
                        };
                        if sent {
                            correlator.enqueue(reply);
                        } else {
                            lines_tx = None;
                            let _ = reply.send(Err(RequestError::ChannelClosed));
                        }
                    }
                    Some(ChannelCommand::End) => {
                        if lines_tx.take().is_some() {
                            tracing::debug!(helper = %label, pending = correlator.pending(), "Ending helper input");
                        }
                    }
                    None => {
                        // Every bridge handle is gone: same as end().
                        commands_open = false;
                        lines_tx = None;
                    }
                }
            }

            status = wait_child(&mut child), if exit.is_none() && child.is_some() => {
                exit = Some(status);
                // Output can outlive the process when a descendant inherited
                // it, so only take what is already on its way.
                let deadline = tokio::time::Instant::now() + EXIT_GRACE;
                while let Ok(Some(Ok(line))) = tokio::time::timeout_at(deadline, reader.next()).await {
                    dispatch(correlator.as_mut(), &line, &label);
                }
                tracing::debug!(helper = %label, "Helper process exited");
                break;
            }
        }
    }

    let rejected = correlator.on_closed();
    if rejected > 0 {
        tracing::warn!(helper = %label, rejected, "Helper channel closed with requests pending");
    }
    drop(lines_tx);

    // Requests that raced the close never reached the helper.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let ChannelCommand::Request { reply, .. } = command {
            let _ = reply.send(Err(RequestError::ChannelClosed));
        }
    }

    match (exit, child.as_mut()) {
        (Some(status), _) => log_exit(&label, status),
        (None, Some(child)) => log_exit(&label, child.wait().await),
        (None, None) => {}
    }

    let _ = closed_tx.send(true);
    tracing::debug!(helper = %label, "Event loop exiting");
}
