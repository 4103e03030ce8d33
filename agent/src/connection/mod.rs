//! Reverse connection to a single broker instance.
//!
//! Dials the broker, sends the introduction line, then runs the command
//! pipeline until the broker resets the connection, the socket fails, or
//! the owner cancels. Failed dials back off with a randomized delay and
//! periodically ask the owner to re-resolve check configuration.

mod command;
mod metrics;
pub mod stream;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::check::ReverseConfig;
use crate::config::ReverseSettings;
use crate::error::{Error, Result};
use metrics::{send_metric_data, SendOutcome};
use stream::BrokerStream;

/// Delay before the first retry
pub const MIN_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for the retry delay
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// Range (seconds) of the random step added to the delay per failed attempt
const DELAY_STEP_SECS: std::ops::Range<u64> = 1..20;

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    /// Dialed and introduced, waiting for a command
    ConnIdle,
    /// Servicing a CONNECT
    ConnActive,
    Error,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::New => "NEW",
            State::ConnIdle => "CONN_IDLE",
            State::ConnActive => "CONN_ACTIVE",
            State::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Mutable per-connection bookkeeping, shared with the reader stage
#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) attempts: u32,
    pub(crate) delay: Duration,
    pub(crate) comm_timeouts: u32,
    pub(crate) state: State,
    pub(crate) last_request: Option<Instant>,
}

impl Default for ConnState {
    fn default() -> Self {
        Self {
            attempts: 0,
            delay: MIN_DELAY,
            comm_timeouts: 0,
            state: State::New,
            last_request: None,
        }
    }
}

/// Next retry delay: a random 1-19s step, capped at [`MAX_DELAY`].
pub fn next_delay(current: Duration) -> Duration {
    if current >= MAX_DELAY {
        return MAX_DELAY;
    }
    let step = rand::thread_rng().gen_range(DELAY_STEP_SECS);
    (current + Duration::from_secs(step)).min(MAX_DELAY)
}

/// Reverse connection to one broker instance
pub struct Connection {
    config: Arc<ReverseConfig>,
    agent_address: String,
    settings: Arc<ReverseSettings>,
    state: Arc<Mutex<ConnState>>,
}

impl Connection {
    pub fn new(config: Arc<ReverseConfig>, agent_address: String, settings: Arc<ReverseSettings>) -> Self {
        Self {
            config,
            agent_address,
            settings,
            state: Arc::new(Mutex::new(ConnState::default())),
        }
    }

    pub async fn state(&self) -> State {
        self.state.lock().await.state
    }

    /// When the last CONNECT was received on this connection
    pub async fn last_request(&self) -> Option<Instant> {
        self.state.lock().await.last_request
    }

    async fn set_state(&self, state: State) {
        self.state.lock().await.state = state;
    }

    /// Clear the retry bookkeeping after a full request/response cycle.
    pub async fn reset_connection_attempts(&self) {
        let mut state = self.state.lock().await;
        if state.attempts > 0 {
            state.delay = MIN_DELAY;
            state.attempts = 0;
        }
    }

    /// Run until cancelled or a failure the connection cannot handle itself.
    ///
    /// Returns `Ok(())` only on cancellation.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.connect() => res,
            };

            let stream = match connected {
                Ok(stream) => stream,
                Err(e) => {
                    self.set_state(State::Error).await;
                    if e.is_retryable() {
                        let attempts = self.state.lock().await.attempts;
                        warn!(cn = %self.config.cn, attempts, error = %e, "Connect failed");
                        continue;
                    }
                    return Err(e);
                }
            };

            self.serve(stream, &cancel).await?;
        }
    }

    async fn connect(&self) -> Result<BrokerStream> {
        let (attempts, delay) = {
            let state = self.state.lock().await;
            (state.attempts, state.delay)
        };

        if attempts > 0 {
            if let Some(max) = self.settings.max_conn_retry {
                if attempts >= max {
                    return Err(Error::MaxAttempts(attempts));
                }
            }

            info!(cn = %self.config.cn, attempt = attempts, delay = ?delay, "Connect retry");
            sleep(delay).await;
            self.state.lock().await.delay = next_delay(delay);

            // broker address, certificate or ownership may have changed
            let limit = self.settings.config_retry_limit;
            if limit > 0 && attempts % limit == 0 {
                info!(cn = %self.config.cn, attempts, "Reconfig triggered");
                return Err(Error::RefreshNeeded(format!(
                    "{} failed connection attempts",
                    attempts
                )));
            }
        }

        self.state.lock().await.attempts += 1;

        let host = &self.config.reverse_url.host;
        debug!(cn = %self.config.cn, "Connecting to {}", host);
        let mut stream = stream::dial(&self.config, self.settings.dial_timeout).await?;
        info!(cn = %self.config.cn, "Connected to {}", host);

        let intro = self.config.reverse_url.intro();
        debug!("Sending intro {:?}", intro.trim_end());
        let sent = timeout(self.settings.comm_timeout, async {
            stream.write_all(intro.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()));
        if let Err(source) = sent {
            return Err(Error::Intro {
                addr: host.clone(),
                source,
            });
        }

        let mut state = self.state.lock().await;
        state.state = State::ConnIdle;
        state.comm_timeouts = 0;
        Ok(stream)
    }

    /// Run the command pipeline over one established socket.
    ///
    /// `Ok(())` means reconnect; errors go to the owner.
    async fn serve(&self, stream: BrokerStream, cancel: &CancellationToken) -> Result<()> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let cmd_cancel = cancel.child_token();

        let (reader, commands) = command::spawn_reader(
            read_half,
            self.state.clone(),
            self.settings.clone(),
            cmd_cancel.clone(),
        );
        let (processor, mut results) = command::spawn_processor(
            commands,
            self.agent_address.clone(),
            self.settings.metric_timeout,
            cmd_cancel.clone(),
        );

        let mut outcome = Ok(());
        while let Some(cmd) = results.recv().await {
            if cmd.ignore {
                if let Some(err) = &cmd.err {
                    debug!(channel_id = cmd.channel_id, cmd = %cmd.name, "Ignoring: {}", err);
                }
                continue;
            }

            if let Some(err) = &cmd.err {
                if cmd.reset {
                    warn!(cn = %self.config.cn, channel_id = cmd.channel_id, cmd = %cmd.name, error = %err, "Resetting connection");
                    break;
                }
                if cmd.fatal {
                    error!(cn = %self.config.cn, channel_id = cmd.channel_id, cmd = %cmd.name, error = %err, "Fatal command error");
                    outcome = Err(Error::FatalCommand(err.to_string()));
                    break;
                }
                warn!(channel_id = cmd.channel_id, cmd = %cmd.name, error = %err, "Unhandled command error state");
                continue;
            }

            {
                let mut state = self.state.lock().await;
                state.state = State::ConnActive;
                state.last_request = Some(cmd.start);
            }
            let sent = send_metric_data(
                &mut write_half,
                cmd.channel_id,
                cmd.metrics.as_deref(),
                cmd.start,
                &self.settings,
            )
            .await;
            self.set_state(State::ConnIdle).await;

            match sent {
                Ok(SendOutcome::Sent) => self.reset_connection_attempts().await,
                Ok(SendOutcome::Recycle) => {
                    info!(cn = %self.config.cn, channel_id = cmd.channel_id, "Max requests reached, recycling connection");
                    self.reset_connection_attempts().await;
                    break;
                }
                Err(e) => {
                    warn!(cn = %self.config.cn, channel_id = cmd.channel_id, error = %e, "Sending metric data");
                    outcome = Err(Error::RefreshNeeded(e.to_string()));
                    break;
                }
            }
        }

        cmd_cancel.cancel();
        if let Err(e) = reader.await {
            warn!("Command reader task failed: {}", e);
        }
        if let Err(e) = processor.await {
            warn!("Command processor task failed: {}", e);
        }
        let _ = timeout(self.settings.comm_timeout, write_half.shutdown()).await;
        debug!(cn = %self.config.cn, "Connection closed");

        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::check::tests::{
        plain_broker, temp_file, tls_broker, TEST_BROKER_CERT, TEST_BROKER_KEY, TEST_CA,
    };
    use revagent_shared::protocol::{encode_frame, read_frame, Frame};
    use tokio::io::{AsyncRead, AsyncReadExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    /// Local endpoint answering every request with `body` and closing.
    pub(crate) async fn stub_metrics_endpoint(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                read_until_blank_line(&mut socket).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    pub(crate) async fn read_until_blank_line<S>(socket: &mut S) -> String
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            match socket.read(&mut byte).await {
                Ok(0) | Err(_) => break,
                Ok(_) => buf.push(byte[0]),
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Broker side TLS serving the `broker01.example.com` certificate
    fn tls_acceptor() -> TlsAcceptor {
        let certs = rustls_pemfile::certs(&mut TEST_BROKER_CERT.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut TEST_BROKER_KEY.as_bytes())
            .unwrap()
            .unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    fn connection(broker_addr: &str, agent_address: &str, settings: ReverseSettings) -> Connection {
        let config = ReverseConfig::from_broker(&plain_broker("broker01", broker_addr, true)).unwrap();
        Connection::new(Arc::new(config), agent_address.to_string(), Arc::new(settings))
    }

    async fn refused_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[test]
    fn test_next_delay_bounds() {
        let mut delay = MIN_DELAY;
        for _ in 0..1000 {
            let next = next_delay(delay);
            assert!(next <= MAX_DELAY);
            if delay < MAX_DELAY {
                assert!(next > delay);
            }
            delay = next;
        }
        assert_eq!(delay, MAX_DELAY);
        assert_eq!(next_delay(MAX_DELAY), MAX_DELAY);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(State::New.to_string(), "NEW");
        assert_eq!(State::ConnIdle.to_string(), "CONN_IDLE");
        assert_eq!(State::ConnActive.to_string(), "CONN_ACTIVE");
        assert_eq!(State::Error.to_string(), "ERROR");
    }

    #[tokio::test]
    async fn test_reset_connection_attempts() {
        let conn = connection("127.0.0.1:1", "127.0.0.1:2", ReverseSettings::default());
        {
            let mut state = conn.state.lock().await;
            state.attempts = 7;
            state.delay = Duration::from_secs(42);
        }
        conn.reset_connection_attempts().await;
        let state = conn.state.lock().await;
        assert_eq!(state.attempts, 0);
        assert_eq!(state.delay, MIN_DELAY);
    }

    #[tokio::test]
    async fn test_connect_sends_metrics() {
        let agent_address = stub_metrics_endpoint(b"{\"test\":1}").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let intro = read_until_blank_line(&mut socket).await;
            socket.write_all(&encode_frame(1, true, b"CONNECT")).await.unwrap();
            socket
                .write_all(&encode_frame(1, false, b"GET / HTTP/1.1\r\n\r\n"))
                .await
                .unwrap();

            let mut payload = Vec::new();
            while payload.len() < b"{\"test\":1}".len() {
                match read_frame(&mut socket, Some(Duration::from_secs(5))).await.unwrap() {
                    Frame::Data { channel_id, payload: chunk } => {
                        assert_eq!(channel_id, 1);
                        payload.extend(chunk);
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            (intro, payload)
        });

        let conn = Arc::new(connection(&broker_addr, &agent_address, ReverseSettings::default()));
        let cancel = CancellationToken::new();
        let running = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { conn.start(cancel).await })
        };

        let (intro, payload) = timeout(Duration::from_secs(10), broker).await.unwrap().unwrap();
        assert_eq!(intro, "REVERSE /check/1234#secret HTTP/1.1\r\n\r\n");
        assert_eq!(payload, b"{\"test\":1}");

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_reset_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();

        let broker = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            read_until_blank_line(&mut first).await;
            first.write_all(&encode_frame(1, true, b"RESET")).await.unwrap();

            let (mut second, _) = listener.accept().await.unwrap();
            let intro = read_until_blank_line(&mut second).await;

            // agent closed the first socket before redialing
            let mut rest = Vec::new();
            let closed = first.read_to_end(&mut rest).await.is_ok();
            (intro, closed)
        });

        let conn = Arc::new(connection(&broker_addr, "127.0.0.1:1", ReverseSettings::default()));
        let cancel = CancellationToken::new();
        let running = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { conn.start(cancel).await })
        };

        let (intro, closed) = timeout(Duration::from_secs(10), broker).await.unwrap().unwrap();
        assert!(intro.starts_with("REVERSE /check/1234"));
        assert!(closed);
        assert!(!running.is_finished());

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_after_retry_limit() {
        let settings = ReverseSettings {
            config_retry_limit: 1,
            dial_timeout: Duration::from_secs(1),
            ..ReverseSettings::default()
        };
        let conn = connection(&refused_addr().await, "127.0.0.1:1", settings);

        let err = timeout(Duration::from_secs(10), conn.start(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.needs_refresh(), "unexpected error: {}", err);
        assert_eq!(conn.state().await, State::Error);
    }

    #[tokio::test]
    async fn test_max_attempts_is_fatal() {
        let settings = ReverseSettings {
            max_conn_retry: Some(1),
            config_retry_limit: 0,
            dial_timeout: Duration::from_secs(1),
            ..ReverseSettings::default()
        };
        let conn = connection(&refused_addr().await, "127.0.0.1:1", settings);

        let err = timeout(Duration::from_secs(5), conn.start(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::MaxAttempts(1)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let conn = Arc::new(connection(&refused_addr().await, "127.0.0.1:1", ReverseSettings::default()));
        conn.state.lock().await.delay = MAX_DELAY;
        conn.state.lock().await.attempts = 1;

        let cancel = CancellationToken::new();
        let running = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { conn.start(cancel).await })
        };
        sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tls_connect_sends_metrics() {
        let ca = temp_file("tls-e2e-ca.pem", TEST_CA);
        let agent_address = stub_metrics_endpoint(b"{\"test\":1}").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let acceptor = tls_acceptor();

        let broker = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = acceptor.accept(tcp).await.unwrap();
            let intro = read_until_blank_line(&mut socket).await;
            socket.write_all(&encode_frame(1, true, b"CONNECT")).await.unwrap();
            socket
                .write_all(&encode_frame(1, false, b"GET / HTTP/1.1\r\n\r\n"))
                .await
                .unwrap();
            socket.flush().await.unwrap();

            let mut payload = Vec::new();
            while payload.len() < b"{\"test\":1}".len() {
                match read_frame(&mut socket, Some(Duration::from_secs(5))).await.unwrap() {
                    Frame::Data { channel_id, payload: chunk } => {
                        assert_eq!(channel_id, 1);
                        payload.extend(chunk);
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
            (intro, payload)
        });

        let config = ReverseConfig::from_broker(&tls_broker("broker01.example.com", &broker_addr, &ca)).unwrap();
        assert!(config.tls.is_some());
        let conn = Arc::new(Connection::new(
            Arc::new(config),
            agent_address,
            Arc::new(ReverseSettings::default()),
        ));
        let cancel = CancellationToken::new();
        let running = {
            let conn = conn.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { conn.start(cancel).await })
        };

        let (intro, payload) = timeout(Duration::from_secs(10), broker).await.unwrap().unwrap();
        assert_eq!(intro, "REVERSE /check/1234#secret HTTP/1.1\r\n\r\n");
        assert_eq!(payload, b"{\"test\":1}");

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(result.is_ok());
        std::fs::remove_file(ca).ok();
    }

    #[tokio::test]
    async fn test_tls_rejects_mismatched_cn() {
        let ca = temp_file("tls-cn-ca.pem", TEST_CA);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let acceptor = tls_acceptor();
        tokio::spawn(async move {
            if let Ok((tcp, _)) = listener.accept().await {
                let _ = acceptor.accept(tcp).await;
            }
        });

        let config = ReverseConfig::from_broker(&tls_broker("broker02.example.com", &broker_addr, &ca)).unwrap();
        let err = stream::dial(&config, Duration::from_secs(5))
            .await
            .err()
            .expect("certificate is for another broker");
        assert!(matches!(err, Error::Tls { .. }), "unexpected error: {}", err);
        assert!(err.is_retryable());
        std::fs::remove_file(ca).ok();
    }

    #[tokio::test]
    async fn test_unusable_agent_address_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = listener.local_addr().unwrap().to_string();
        let _broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_until_blank_line(&mut socket).await;
            socket.write_all(&encode_frame(1, true, b"CONNECT")).await.unwrap();
            socket
                .write_all(&encode_frame(1, false, b"GET / HTTP/1.1\r\n\r\n"))
                .await
                .unwrap();
            // hold the socket open until the agent hangs up
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let conn = connection(&broker_addr, "no-port-here", ReverseSettings::default());
        let err = timeout(Duration::from_secs(10), conn.start(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::FatalCommand(_)), "unexpected error: {}", err);
        assert!(err.is_fatal());
    }
}
