//! In-process STOMP broker used by the integration tests.
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stomp_vu::codec::{decode_all, encode_to_vec};
use stomp_vu::transport::WS_SUBPROTOCOL;
use stomp_vu::{ClientConfig, Frame, StompCodec, StompItem};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_util::codec::Framed;

pub type BrokerStream = Framed<TcpStream, StompCodec>;
pub type WsBrokerStream = WebSocketStream<TcpStream>;

/// Accept one connection on a random port and hand it to `handler`.
/// Returns the address to connect to.
pub async fn spawn_broker<F, Fut>(handler: F) -> String
where
    F: FnOnce(BrokerStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            handler(Framed::new(stream, StompCodec::new())).await;
        }
    });
    addr
}

/// Client config with short timeouts for tests.
pub fn test_config(addr: &str) -> ClientConfig {
    ClientConfig::new(addr)
        .timeout(Duration::from_secs(2))
        .heartbeat(Duration::ZERO, Duration::ZERO)
        .receipt_timeout(Duration::from_secs(2))
        .disconnect_timeout(Duration::from_millis(500))
}

/// Next frame from the client, skipping heartbeats. `None` on EOF.
pub async fn next_frame(framed: &mut BrokerStream) -> Option<Frame> {
    loop {
        match framed.next().await {
            Some(Ok(StompItem::Frame(frame))) => return Some(frame),
            Some(Ok(StompItem::Heartbeat)) => continue,
            _ => return None,
        }
    }
}

pub async fn send_frame(framed: &mut BrokerStream, frame: Frame) {
    framed
        .send(StompItem::Frame(frame))
        .await
        .expect("broker send failed");
}

/// Read CONNECT and answer CONNECTED with `heart_beat`. Returns the CONNECT.
pub async fn handshake(framed: &mut BrokerStream, heart_beat: &str) -> Frame {
    let connect = next_frame(framed).await.expect("no CONNECT");
    assert_eq!(connect.command, "CONNECT");
    send_frame(
        framed,
        Frame::new("CONNECTED")
            .header("version", "1.2")
            .header("server", "mock-broker/1.0")
            .header("session", "session-1")
            .header("heart-beat", heart_beat),
    )
    .await;
    connect
}

/// What the queue broker observed.
#[derive(Debug, Default)]
pub struct BrokerLog {
    pub frames: Vec<Frame>,
    pub acked: Vec<String>,
    pub nacked: Vec<String>,
}

pub type SharedLog = Arc<Mutex<BrokerLog>>;

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueBehaviour {
    /// Never answer receipts.
    pub drop_receipts: bool,
}

struct Sub {
    id: String,
    destination: String,
}

/// Minimal queue semantics: SEND goes to the first subscription on the
/// destination (or waits for one), receipts are answered, DISCONNECT ends
/// the session.
pub async fn serve_queues(mut framed: BrokerStream, log: SharedLog, behaviour: QueueBehaviour) {
    handshake(&mut framed, "0,0").await;
    let mut subs: Vec<Sub> = Vec::new();
    let mut backlog: HashMap<String, VecDeque<Frame>> = HashMap::new();
    let mut next_id = 0u64;

    while let Some(frame) = next_frame(&mut framed).await {
        log.lock().unwrap().frames.push(frame.clone());
        let receipt = frame.get_header("receipt").map(str::to_string);
        match frame.command.as_str() {
            "SEND" => {
                let destination = frame.get_header("destination").unwrap_or("").to_string();
                backlog.entry(destination).or_default().push_back(frame.clone());
            }
            "SUBSCRIBE" => subs.push(Sub {
                id: frame.get_header("id").unwrap_or("").to_string(),
                destination: frame.get_header("destination").unwrap_or("").to_string(),
            }),
            "UNSUBSCRIBE" => {
                let id = frame.get_header("id").unwrap_or("");
                subs.retain(|s| s.id != id);
            }
            "ACK" => log
                .lock()
                .unwrap()
                .acked
                .push(frame.get_header("id").unwrap_or("").to_string()),
            "NACK" => log
                .lock()
                .unwrap()
                .nacked
                .push(frame.get_header("id").unwrap_or("").to_string()),
            _ => {}
        }

        if let Some(receipt) = receipt {
            if !behaviour.drop_receipts || frame.command == "DISCONNECT" {
                send_frame(&mut framed, Frame::new("RECEIPT").header("receipt-id", receipt)).await;
            }
        }
        if frame.command == "DISCONNECT" {
            break;
        }

        for sub in &subs {
            if let Some(queue) = backlog.get_mut(&sub.destination) {
                while let Some(sent) = queue.pop_front() {
                    next_id += 1;
                    let mut message = Frame::new("MESSAGE")
                        .header("destination", &sub.destination)
                        .header("subscription", &sub.id)
                        .header("message-id", format!("m-{}", next_id));
                    if let Some(ct) = sent.get_header("content-type") {
                        message = message.header("content-type", ct);
                    }
                    send_frame(&mut framed, message.set_body(sent.body)).await;
                }
            }
        }
    }
}

/// Spawn a queue broker and return its address and log.
pub async fn spawn_queue_broker(behaviour: QueueBehaviour) -> (String, SharedLog) {
    let log: SharedLog = Arc::default();
    let broker_log = log.clone();
    let addr = spawn_broker(move |framed| serve_queues(framed, broker_log, behaviour)).await;
    (addr, log)
}

/// What the client asked for in its WebSocket upgrade.
#[derive(Debug, Clone)]
pub struct Upgrade {
    pub path: String,
    pub protocol: Option<String>,
}

/// Accept one WebSocket connection on a random port. The upgrade is
/// refused unless the client offers the STOMP sub-protocol, which is then
/// echoed back.
pub async fn spawn_ws_broker<F, Fut>(handler: F) -> String
where
    F: FnOnce(WsBrokerStream, Upgrade) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut upgrade = None;
        let callback = |req: &Request, mut resp: Response| {
            let protocol = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let offered = protocol
                .as_deref()
                .is_some_and(|p| p.split(',').any(|p| p.trim() == WS_SUBPROTOCOL));
            upgrade = Some(Upgrade {
                path: req.uri().path().to_string(),
                protocol,
            });
            if !offered {
                let mut refusal = ErrorResponse::new(Some("STOMP sub-protocol required".into()));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                return Err(refusal);
            }
            resp.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(WS_SUBPROTOCOL),
            );
            Ok(resp)
        };
        let accepted = tokio_tungstenite::accept_hdr_async(stream, callback).await;
        if let (Ok(ws), Some(upgrade)) = (accepted, upgrade) {
            handler(ws, upgrade).await;
        }
    });
    addr
}

/// Next item from a WebSocket client. `None` on close or EOF.
pub async fn ws_next_item(ws: &mut WsBrokerStream) -> Option<StompItem> {
    loop {
        let bytes = match ws.next().await? {
            Ok(WsMessage::Text(text)) => text.as_bytes().to_vec(),
            Ok(WsMessage::Binary(bytes)) => bytes.to_vec(),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        let mut items = decode_all(&bytes).expect("client sent a malformed frame");
        assert!(items.len() <= 1, "one STOMP item per message, got {:?}", items);
        if let Some(item) = items.pop() {
            return Some(item);
        }
    }
}

/// Next frame from a WebSocket client, skipping heartbeats.
pub async fn ws_next_frame(ws: &mut WsBrokerStream) -> Option<Frame> {
    loop {
        match ws_next_item(ws).await? {
            StompItem::Frame(frame) => return Some(frame),
            StompItem::Heartbeat => continue,
        }
    }
}

pub async fn ws_send_frame(ws: &mut WsBrokerStream, frame: Frame) {
    let bytes = encode_to_vec(StompItem::Frame(frame)).expect("encode");
    let text = String::from_utf8(bytes).expect("text frame");
    ws.send(WsMessage::text(text))
        .await
        .expect("broker send failed");
}
