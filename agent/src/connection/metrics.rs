//! Metrics bridge: relays a broker's CONNECT request to the local agent
//! listener and streams the response back in frames.

use std::io;
use std::time::{Duration, Instant};

use revagent_shared::protocol::{encode_frame, MAX_PAYLOAD_LEN};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ReverseSettings;
use crate::error::{Error, Result};

/// Sent in place of an empty response
const EMPTY_METRICS: &[u8] = b"{}";

/// What the connection should do after a response went out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Sent,
    /// Request limit reached, drop the connection so the broker reconnects
    Recycle,
}

/// Write the broker's raw HTTP request to the local agent and read the
/// whole response, all within `metric_timeout`.
pub(crate) async fn fetch_metric_data(
    agent_address: &str,
    request: &[u8],
    channel_id: u16,
    metric_timeout: Duration,
) -> Result<Vec<u8>> {
    let fetch = async {
        let mut stream = TcpStream::connect(agent_address).await?;
        stream.write_all(request).await?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        Ok::<_, io::Error>(data)
    };

    match timeout(metric_timeout, fetch).await {
        Ok(Ok(data)) => {
            debug!(channel_id, bytes = data.len(), "Fetched metrics from {}", agent_address);
            Ok(data)
        }
        Ok(Err(source)) => Err(Error::Fetch {
            addr: agent_address.to_string(),
            source,
        }),
        Err(_) => Err(Error::FetchTimeout(metric_timeout)),
    }
}

/// Frame `data` on `channel_id` in chunks of at most [`MAX_PAYLOAD_LEN`] bytes.
pub(crate) async fn send_metric_data<W>(
    writer: &mut W,
    channel_id: u16,
    data: Option<&[u8]>,
    start: Instant,
    settings: &ReverseSettings,
) -> Result<SendOutcome>
where
    W: AsyncWrite + Unpin,
{
    let data = match data {
        Some(data) if !data.is_empty() => data,
        _ => EMPTY_METRICS,
    };

    for chunk in data.chunks(MAX_PAYLOAD_LEN) {
        let frame = encode_frame(channel_id, false, chunk);
        write_with_deadline(writer.write_all(&frame), settings.comm_timeout).await?;
    }
    write_with_deadline(writer.flush(), settings.comm_timeout).await?;

    debug!(
        channel_id,
        bytes = data.len(),
        elapsed = ?start.elapsed(),
        "Sent metrics to broker"
    );

    if let Some(max) = settings.max_requests {
        if channel_id > max {
            return Ok(SendOutcome::Recycle);
        }
    }
    Ok(SendOutcome::Sent)
}

async fn write_with_deadline<F>(write: F, deadline: Duration) -> Result<()>
where
    F: std::future::Future<Output = io::Result<()>>,
{
    match timeout(deadline, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Send(e)),
        Err(_) => Err(Error::Send(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}
