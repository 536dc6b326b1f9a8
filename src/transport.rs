//! Byte transports carrying STOMP: plain TCP, TLS over TCP, and WebSocket
//! (optionally over TLS). Every variant is exposed as the same pair of a
//! boxed item sink and item stream.

use futures::{Sink, SinkExt, Stream, StreamExt, future, stream};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{self, RootCertStore, pki_types::ServerName};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_util::codec::Framed;

use crate::codec::{StompCodec, StompItem, decode_all, encode_to_vec};
use crate::config::ClientConfig;
use crate::error::{ConnectError, StompError};

/// STOMP sub-protocol name requested on the WebSocket upgrade.
pub const WS_SUBPROTOCOL: &str = "v12.stomp";

const WIRE_TARGET: &str = "stomp_vu::wire";

pub type FrameSink = Pin<Box<dyn Sink<StompItem, Error = StompError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StompItem, StompError>> + Send>>;

trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// An open transport, split into its write and read halves.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    /// Log every item crossing the transport at `debug` under the
    /// `stomp_vu::wire` target.
    fn verbose(self) -> Self {
        let sink = self.sink.with(|item: StompItem| {
            tracing::debug!(target: WIRE_TARGET, ">>> {}", describe(&item));
            future::ready(Ok::<_, StompError>(item))
        });
        let stream = self.stream.inspect(|item| match item {
            Ok(item) => tracing::debug!(target: WIRE_TARGET, "<<< {}", describe(item)),
            Err(e) => tracing::debug!(target: WIRE_TARGET, "<<< error: {}", e),
        });
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

fn describe(item: &StompItem) -> String {
    match item {
        StompItem::Heartbeat => "heartbeat".to_string(),
        StompItem::Frame(frame) => frame.to_string(),
    }
}

/// Open the transport selected by `config`.
///
/// No timeout is applied here; the caller bounds open plus handshake.
pub async fn open(config: &ClientConfig) -> Result<Transport, ConnectError> {
    let protocol = config.effective_protocol();
    tracing::debug!(addr = %config.addr, %protocol, "opening transport");

    let tcp = TcpStream::connect(config.addr.as_str()).await?;
    if let Err(e) = tcp.set_nodelay(true) {
        tracing::debug!("set_nodelay failed: {}", e);
    }

    let io: Box<dyn IoStream> = if protocol.is_tls() {
        Box::new(tls_wrap(config, tcp).await?)
    } else {
        Box::new(tcp)
    };

    let transport = if protocol.is_websocket() {
        websocket(config, io).await?
    } else {
        let (sink, stream) = Framed::new(io, StompCodec::new()).split();
        Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    };

    Ok(if config.verbose {
        transport.verbose()
    } else {
        transport
    })
}

async fn tls_wrap(
    config: &ClientConfig,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectError> {
    let connector = tls_connector(config.insecure_skip_tls_verify)?;
    let server_name = ServerName::try_from(config.addr_host().to_string())
        .map_err(|e| ConnectError::Tls(format!("invalid server name: {}", e)))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ConnectError::Tls(e.to_string()))
}

fn tls_connector(insecure: bool) -> Result<TlsConnector, ConnectError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::Tls(e.to_string()))?;
    let tls = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier {
                schemes: provider
                    .signature_verification_algorithms
                    .supported_schemes(),
            }))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(tls)))
}

// Accepts any server certificate; used for `insecureSkipTLSVerify`.
#[derive(Debug)]
struct NoCertVerifier {
    schemes: Vec<rustls::SignatureScheme>,
}

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer,
        _intermediates: &[rustls::pki_types::CertificateDer],
        _server_name: &rustls::pki_types::ServerName,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

/// Build the HTTP upgrade request: the STOMP sub-protocol plus the
/// configured custom headers.
pub(crate) fn websocket_request(config: &ClientConfig) -> Result<Request, ConnectError> {
    let url = config.websocket_url();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectError::WebSocket(format!("invalid url '{}': {}", url, e)))?;
    let headers = request.headers_mut();
    headers.insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(WS_SUBPROTOCOL),
    );
    for (key, value) in &config.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| ConnectError::WebSocket(format!("invalid header name '{}': {}", key, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConnectError::WebSocket(format!("invalid value for '{}': {}", key, e)))?;
        headers.insert(name, value);
    }
    Ok(request)
}

async fn websocket(config: &ClientConfig, io: Box<dyn IoStream>) -> Result<Transport, ConnectError> {
    let request = websocket_request(config)?;
    let (ws, response) = match tokio_tungstenite::client_async(request, io).await {
        Ok(pair) => pair,
        Err(tungstenite::Error::Http(response)) => {
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            return Err(ConnectError::WebSocket(format!(
                "upgrade rejected with {}: {}",
                response.status(),
                body
            )));
        }
        Err(tungstenite::Error::Io(e)) => return Err(e.into()),
        Err(e) => return Err(ConnectError::WebSocket(e.to_string())),
    };
    tracing::debug!(status = %response.status(), "websocket upgraded");

    let (sink, stream) = ws.split();
    let sink = sink
        .sink_map_err(ws_error)
        .with(|item: StompItem| future::ready(encode_ws(item)));
    let stream = stream.flat_map(|message| stream::iter(decode_ws(message)));
    Ok(Transport {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    })
}

fn ws_error(err: tungstenite::Error) -> StompError {
    match err {
        tungstenite::Error::Io(e) => StompError::Io(Arc::new(e)),
        other => StompError::Io(Arc::new(io::Error::other(other))),
    }
}

/// One STOMP item per WebSocket message; heartbeats travel as a bare
/// newline text message.
fn encode_ws(item: StompItem) -> Result<WsMessage, StompError> {
    let bytes = encode_to_vec(item)?;
    Ok(match String::from_utf8(bytes) {
        Ok(text) => WsMessage::text(text),
        Err(e) => WsMessage::binary(e.into_bytes()),
    })
}

/// Decode one WebSocket message. Control frames count as liveness.
fn decode_ws(
    message: Result<WsMessage, tungstenite::Error>,
) -> Vec<Result<StompItem, StompError>> {
    let decoded = match message {
        Ok(WsMessage::Text(text)) => decode_all(text.as_bytes()),
        Ok(WsMessage::Binary(bytes)) => decode_all(&bytes),
        Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => Ok(vec![StompItem::Heartbeat]),
        Ok(WsMessage::Close(_)) | Ok(WsMessage::Frame(_)) => Ok(Vec::new()),
        Err(e) => Err(ws_error(e)),
    };
    match decoded {
        Ok(items) => items.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::frame::Frame;

    #[test]
    fn upgrade_request_carries_subprotocol_and_headers() {
        let config = ClientConfig::new("broker:15674")
            .protocol(Protocol::Ws)
            .path("/ws")
            .header("x-vu", "7");
        let request = websocket_request(&config).unwrap();
        assert_eq!(request.uri().to_string(), "ws://broker:15674/ws");
        assert_eq!(
            request.headers().get("sec-websocket-protocol").unwrap(),
            WS_SUBPROTOCOL
        );
        assert_eq!(request.headers().get("x-vu").unwrap(), "7");
    }

    #[test]
    fn websocket_messages_decode_to_items() {
        let text = WsMessage::text("MESSAGE\nsubscription:1\n\nhi\0");
        let items = decode_ws(Ok(text));
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], Ok(StompItem::Frame(f)) if f.body == b"hi"));

        let beat = decode_ws(Ok(WsMessage::text("\n")));
        assert!(matches!(beat[..], [Ok(StompItem::Heartbeat)]));

        let ping = decode_ws(Ok(WsMessage::Ping(Default::default())));
        assert!(matches!(ping[..], [Ok(StompItem::Heartbeat)]));

        let partial = decode_ws(Ok(WsMessage::text("SEND\ndestination:/q\n")));
        assert!(matches!(partial[..], [Err(StompError::Protocol(_))]));
    }

    #[test]
    fn binary_bodies_go_out_as_binary_messages() {
        let frame = Frame::new("SEND")
            .header("destination", "/q")
            .set_body(vec![0xff, 0x00]);
        assert!(matches!(
            encode_ws(StompItem::Frame(frame)).unwrap(),
            WsMessage::Binary(_)
        ));
        assert_eq!(
            encode_ws(StompItem::Heartbeat).unwrap(),
            WsMessage::text("\n")
        );
    }
}
