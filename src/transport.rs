use crate::error::Error;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector as TlsConnector,
};
use tracing::{debug, trace, warn};
use url::Url;

/// Factory for transports.
///
/// The connection driver calls [`connect`](Connector::connect) for every
/// attempt. An `Err` is treated exactly like a transport that closed
/// immediately.
pub trait Connector: Send + Sync + 'static {
    /// Open a transport to `url`.
    fn connect(&self, url: &Url) -> impl Future<Output = Result<Transport, Error>> + Send;
}

/// An open, message-oriented duplex link.
///
/// Frames are exchanged over channels so the connection driver never owns
/// socket halves directly. Dropping the transport closes it.
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<Result<Message, Error>>,
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    /// Build a transport from raw channel ends.
    ///
    /// The peer reads what the driver sends from the receiver paired with
    /// `outbound` and feeds frames through the sender paired with
    /// `inbound`. Dropping that sender ends the stream.
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<Message>,
        inbound: mpsc::UnboundedReceiver<Result<Message, Error>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    /// Queue a frame. Returns `false` if the link is gone.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Next inbound frame, or `None` once the link has ended.
    pub async fn recv(&mut self) -> Option<Result<Message, Error>> {
        self.inbound.recv().await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // The writer exits on its own once `outbound` is dropped
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// [`Connector`] over real WebSockets (tokio-tungstenite, native TLS).
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl WsConnector {
    /// Create a connector with no extra handshake headers
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector that adds `headers` to every handshake request
    pub fn with_headers(headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        Self { headers }
    }
}

impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Transport, Error> {
        let ws_stream = connect_with_headers(url, &self.headers).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let label = url.path().to_string();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    debug!("[{}] Write failed: {}", label, e);
                    return;
                }
            }
            let _ = write.close().await;
            trace!("[{}] Writer finished", label);
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let is_err = frame.is_err();
                if inbound_tx.send(frame.map_err(Error::WebSocket)).is_err() || is_err {
                    return;
                }
            }
        });

        Ok(Transport {
            outbound: outbound_tx,
            inbound: inbound_rx,
            reader: Some(reader),
        })
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Connect to a WebSocket endpoint with additional handshake headers.
async fn connect_with_headers(
    url: &Url,
    headers: &[(HeaderName, HeaderValue)],
) -> Result<WsStream, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidUrl(format!("No host in URL: {}", url)))?;

    let is_tls = match url.scheme() {
        "wss" => true,
        "ws" => false,
        scheme => {
            return Err(Error::InvalidUrl(format!(
                "Unsupported scheme '{}' in {}",
                scheme, url
            )))
        }
    };
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::connection_failed(url.as_str(), format!("Invalid WebSocket request: {}", e)))?;

    for (name, value) in headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let tcp_stream = connect_direct(url, host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::connection_failed(url.as_str(), format!("TLS error: {}", e)))?;
        Some(TlsConnector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

/// Resolve and open a TCP connection
async fn connect_direct(url: &Url, host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::connection_failed(url.as_str(), format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| {
            Error::connection_failed(url.as_str(), format!("No addresses found for {}", host))
        })?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::connection_failed(url.as_str(), format!("Failed to create socket: {}", e)))?;

    socket.connect(dest_addr).await.map_err(|e| {
        Error::connection_failed(
            url.as_str(),
            format!("TCP connect to {} failed: {}", dest_addr, e),
        )
    })
}

/// Set TCP options so dead peers are noticed below the heartbeat layer too
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    if let Err(e) = sock2.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_roundtrip() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let mut transport = Transport::from_channels(out_tx, in_rx);

        assert!(transport.send(Message::Text("ping".to_string())));
        assert_eq!(out_rx.recv().await, Some(Message::Text("ping".to_string())));

        in_tx.send(Ok(Message::Text("pong".to_string()))).unwrap();
        drop(in_tx);
        assert!(matches!(transport.recv().await, Some(Ok(Message::Text(t))) if t == "pong"));
        assert!(transport.recv().await.is_none());

        drop(out_rx);
        assert!(!transport.send(Message::Text("late".to_string())));
    }

    #[tokio::test]
    async fn test_ws_connector_rejects_non_ws_scheme() {
        let url = Url::parse("http://localhost:1/ws").unwrap();
        let err = WsConnector::new().connect(&url).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidUrl);
    }
}
