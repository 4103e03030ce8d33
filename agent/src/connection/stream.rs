//! Broker socket: plain TCP or TLS over TCP.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::check::ReverseConfig;
use crate::error::{Error, Result};

/// An established connection to a broker instance
pub enum BrokerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Dial the broker, bounding the TCP connect and the TLS handshake by `dial_timeout`.
pub async fn dial(config: &ReverseConfig, dial_timeout: Duration) -> Result<BrokerStream> {
    let addr = &config.broker_addr;

    let tcp = match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
            return Err(Error::DialTimeout(addr.clone()))
        }
        Ok(Err(source)) => {
            return Err(Error::Dial {
                addr: addr.clone(),
                source,
            })
        }
        Err(_) => return Err(Error::DialTimeout(addr.clone())),
    };

    let Some(tls) = &config.tls else {
        debug!("Plain TCP connection to {}", addr);
        return Ok(BrokerStream::Plain(tcp));
    };

    let connector = TlsConnector::from(tls.config.clone());
    match timeout(dial_timeout, connector.connect(tls.server_name.clone(), tcp)).await {
        Ok(Ok(stream)) => {
            debug!("TLS handshake with {} complete", addr);
            Ok(BrokerStream::Tls(Box::new(stream)))
        }
        Ok(Err(source)) => Err(Error::Tls {
            addr: addr.clone(),
            source,
        }),
        Err(_) => Err(Error::DialTimeout(addr.clone())),
    }
}

impl AsyncRead for BrokerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BrokerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BrokerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            BrokerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::tests::plain_broker;
    use crate::check::ReverseConfig;

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let config = ReverseConfig::from_broker(&plain_broker("b1", &addr, true)).unwrap();
        let err = dial(&config, Duration::from_secs(1)).await.err().expect("dial should fail");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_dial_plain() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let config = ReverseConfig::from_broker(&plain_broker("b1", &addr, true)).unwrap();
        let stream = dial(&config, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(stream, BrokerStream::Plain(_)));
    }
}
