//! Command pipeline: a reader stage turning broker frames into commands and
//! a processor stage acting on them.
//!
//! ```text
//! socket ── reader ──(Command)── processor ──(Command)── connection loop
//! ```
//!
//! Both stages stop when their cancellation token fires and drop their
//! sender, so downstream stages end when their channel drains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use revagent_shared::protocol::{read_frame, Frame, CMD_CONNECT, CMD_RESET};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::metrics::fetch_metric_data;
use super::ConnState;
use crate::config::ReverseSettings;

/// Why a command cannot be acted on
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Reading frame: {0}")]
    Read(#[source] revagent_shared::Error),

    #[error("Expected command")]
    ExpectedCommand,

    #[error("Expected request")]
    ExpectedRequest,

    #[error("Received RESET command from broker")]
    Reset,

    #[error("Unused/empty command ({0})")]
    Unused(String),

    #[error("Invalid connect command, 0 length request")]
    EmptyRequest,

    #[error("Fetching metrics: {0}")]
    Fetch(#[source] crate::error::Error),
}

/// A logical broker command built from one or two frames
#[derive(Debug)]
pub struct Command {
    pub name: String,
    pub channel_id: u16,
    /// Raw HTTP request following a CONNECT
    pub request: Vec<u8>,
    /// Response fetched for a CONNECT
    pub metrics: Option<Vec<u8>>,
    pub err: Option<CommandError>,
    pub ignore: bool,
    pub reset: bool,
    pub fatal: bool,
    pub start: Instant,
}

impl Command {
    fn new() -> Self {
        Self {
            name: String::new(),
            channel_id: 0,
            request: Vec::new(),
            metrics: None,
            err: None,
            ignore: false,
            reset: false,
            fatal: false,
            start: Instant::now(),
        }
    }

    fn protocol_violation(&mut self, err: CommandError) {
        self.err = Some(err);
        self.reset = true;
    }
}

/// Read one frame, applying the comm timeout bookkeeping.
async fn next_frame<R>(
    reader: &mut R,
    state: &Mutex<ConnState>,
    settings: &ReverseSettings,
    cmd: &mut Command,
) -> Option<Frame>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, Some(settings.comm_timeout)).await {
        Ok(frame) => {
            state.lock().await.comm_timeouts = 0;
            Some(frame)
        }
        Err(e) => {
            if e.is_timeout() {
                let mut state = state.lock().await;
                state.comm_timeouts += 1;
                // reads are only interruptible between frames, absorb a few idle timeouts
                if state.comm_timeouts <= settings.max_comm_timeouts {
                    cmd.ignore = true;
                    cmd.reset = false;
                } else {
                    cmd.reset = true;
                }
            } else {
                // includes a timeout that cut a frame short, the stream is misaligned
                cmd.reset = true;
            }
            cmd.err = Some(CommandError::Read(e));
            None
        }
    }
}

/// Read the next command off the wire, plus its request frame for CONNECT.
pub(crate) async fn read_command<R>(
    reader: &mut R,
    state: &Mutex<ConnState>,
    settings: &ReverseSettings,
) -> Command
where
    R: AsyncRead + Unpin,
{
    let mut cmd = Command::new();

    let Some(frame) = next_frame(reader, state, settings, &mut cmd).await else {
        return cmd;
    };

    cmd.channel_id = frame.channel_id();
    if !frame.is_command() {
        cmd.protocol_violation(CommandError::ExpectedCommand);
        return cmd;
    }
    cmd.name = String::from_utf8_lossy(&frame.into_payload()).into_owned();

    if cmd.name == CMD_CONNECT {
        match next_frame(reader, state, settings, &mut cmd).await {
            Some(Frame::Data { payload, .. }) => cmd.request = payload,
            Some(Frame::Command { .. }) => cmd.protocol_violation(CommandError::ExpectedRequest),
            None => {}
        }
    }

    cmd
}

/// Interpret a command read off the wire.
pub(crate) async fn process_command(
    mut cmd: Command,
    agent_address: &str,
    metric_timeout: Duration,
) -> Command {
    if cmd.err.is_some() {
        return cmd;
    }

    match cmd.name.as_str() {
        CMD_RESET => {
            cmd.reset = true;
            cmd.err = Some(CommandError::Reset);
        }
        CMD_CONNECT => {
            if cmd.request.is_empty() {
                cmd.reset = true;
                cmd.err = Some(CommandError::EmptyRequest);
            } else {
                match fetch_metric_data(agent_address, &cmd.request, cmd.channel_id, metric_timeout).await {
                    Ok(data) => cmd.metrics = Some(data),
                    Err(e) => {
                        // no request can ever reach an unusable agent address
                        cmd.fatal = e.is_invalid_address();
                        cmd.err = Some(CommandError::Fetch(e));
                    }
                }
            }
        }
        other => {
            cmd.ignore = true;
            cmd.err = Some(CommandError::Unused(other.to_string()));
        }
    }

    cmd
}

/// Spawn the reader stage over the read half of a broker socket.
pub(crate) fn spawn_reader<R>(
    mut reader: R,
    state: Arc<Mutex<ConnState>>,
    settings: Arc<ReverseSettings>,
    cancel: CancellationToken,
) -> (JoinHandle<()>, mpsc::Receiver<Command>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        loop {
            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = read_command(&mut reader, &state, &settings) => cmd,
            };

            // the socket is unusable after a reset-worthy read
            let last = cmd.reset || cmd.fatal;
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(cmd) => if sent.is_err() { break },
            }
            if last {
                break;
            }
        }
    });

    (handle, rx)
}

/// Spawn the processor stage consuming the reader's commands.
pub(crate) fn spawn_processor(
    mut commands: mpsc::Receiver<Command>,
    agent_address: String,
    metric_timeout: Duration,
    cancel: CancellationToken,
) -> (JoinHandle<()>, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        loop {
            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            let cmd = tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = process_command(cmd, &agent_address, metric_timeout) => cmd,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(cmd) => if sent.is_err() { break },
            }
        }
    });

    (handle, rx)
}
