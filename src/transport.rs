//! Realtime channel to the chat backend
//!
//! One connection per selected conversation. Connections never reconnect on
//! their own; they report `Error`/`Close` and the session decides.

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::events::{EventSink, TransportEvent};
use crate::messages::ConversationKey;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Opens connections bound to (conversation, credential).
///
/// `open` fails with `Error::Transport` when no connection attempt can be made
/// at all; failures after that arrive as `TransportEvent::Error`.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        peer: &ConversationKey,
        credential: &Credential,
        sink: EventSink,
    ) -> Result<Box<dyn Connection>>;
}

/// Handle to one open (or opening) connection
pub trait Connection: Send {
    fn peer(&self) -> &str;

    /// Fire-and-forget; any acknowledgement arrives later as an inbound frame
    fn send(&mut self, payload: String);

    /// Safe to call any number of times, before or after the socket opened
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// `<ws_base>/ws/chat/<peer>/<credential>`
pub fn channel_url(ws_base: &str, peer: &ConversationKey, credential: &Credential) -> String {
    format!(
        "{}/ws/chat/{}/{}",
        ws_base.trim_end_matches('/'),
        peer.as_str(),
        credential.token()
    )
}

#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

/// Websocket transport
pub struct WsTransport {
    ws_base: String,
}

impl WsTransport {
    pub fn new(ws_base: &str) -> Self {
        Self {
            ws_base: ws_base.trim_end_matches('/').to_string(),
        }
    }
}

impl Transport for WsTransport {
    fn open(
        &self,
        peer: &ConversationKey,
        credential: &Credential,
        sink: EventSink,
    ) -> Result<Box<dyn Connection>> {
        let request = channel_request(&channel_url(&self.ws_base, peer, credential))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let label = peer.to_string();

        info!("Opening chat channel to {}", label);
        // Detached: the socket task ends by itself once closed
        tokio::spawn(run_socket(request, label.clone(), rx, sink));

        Ok(Box::new(WsConnection {
            peer: label,
            outbound: Some(tx),
        }))
    }
}

struct WsConnection {
    peer: String,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

impl Connection for WsConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn send(&mut self, payload: String) {
        match &self.outbound {
            Some(tx) => {
                if tx.send(Outbound::Frame(payload)).is_err() {
                    debug!("Channel to {} already gone, frame dropped", self.peer);
                }
            }
            None => debug!("Send on closed channel to {}", self.peer),
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.outbound.take() {
            debug!("Closing chat channel to {}", self.peer);
            let _ = tx.send(Outbound::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.outbound.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handshake request for a channel URL
fn channel_request(url: &str) -> Result<Request> {
    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(Error::Transport(
            "chat channel URL must start with ws:// or wss://".to_string(),
        ));
    }
    url.into_client_request()
        .map_err(|e| Error::Transport(format!("invalid chat channel URL: {}", e)))
}

async fn run_socket(
    request: Request,
    peer: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    sink: EventSink,
) {
    let mut queued = Vec::new();

    let connect = connect_async(request);
    tokio::pin!(connect);

    let stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    warn!("Chat channel to {} failed to open: {}", peer, e);
                    sink.emit(TransportEvent::Error(e.to_string()));
                    return;
                }
            },
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => queued.push(frame),
                Some(Outbound::Close) | None => {
                    debug!("Chat channel to {} closed before it opened", peer);
                    return;
                }
            },
        }
    };

    info!("Connected to chat with {}", peer);
    sink.emit(TransportEvent::Open);

    let (mut write, mut read) = stream.split();

    for frame in queued {
        if let Err(e) = write.send(WsMessage::Text(frame)).await {
            sink.emit(TransportEvent::Error(e.to_string()));
            return;
        }
    }

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = write.send(WsMessage::Text(frame)).await {
                        warn!("Chat channel to {} send failed: {}", peer, e);
                        sink.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    sink.emit(TransportEvent::Close(Some("closed locally".to_string())));
                    break;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    sink.emit(TransportEvent::Message(text));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    sink.emit(TransportEvent::Message(String::from_utf8_lossy(&data).into_owned()));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason));
                    info!("Chat channel to {} closed by server: {:?}", peer, reason);
                    sink.emit(TransportEvent::Close(reason));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Chat channel to {} errored: {}", peer, e);
                    sink.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => {
                    sink.emit(TransportEvent::Close(None));
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{SessionEvent, SessionEventKind};

    fn key(s: &str) -> ConversationKey {
        ConversationKey::parse(s).unwrap()
    }

    #[test]
    fn test_channel_url() {
        let cred = Credential::new("tok123").unwrap();
        assert_eq!(
            channel_url("ws://127.0.0.1:8000/", &key("bob"), &cred),
            "ws://127.0.0.1:8000/ws/chat/bob/tok123"
        );
    }

    #[tokio::test]
    async fn test_bad_base_url_fails_to_open() {
        let (tx, _rx) = mpsc::unbounded_channel::<SessionEvent>();
        let cred = Credential::new("tok").unwrap();

        for base in ["http://127.0.0.1:8000", "ws://bad host"] {
            let transport = WsTransport::new(base);
            let result = transport.open(&key("bob"), &cred, EventSink::new(1, tx.clone()));
            assert!(matches!(result, Err(Error::Transport(_))), "{} accepted", base);
        }
    }

    #[test]
    fn test_channel_request_accepts_ws_urls() {
        assert!(channel_request("ws://127.0.0.1:8000/ws/chat/bob/tok").is_ok());
        assert!(channel_request("wss://chat.example.com/ws/chat/bob/tok").is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel::<SessionEvent>();
        let transport = WsTransport::new("ws://127.0.0.1:9");
        let cred = Credential::new("tok").unwrap();

        let mut conn = transport.open(&key("bob"), &cred, EventSink::new(1, tx)).unwrap();
        assert_eq!(conn.peer(), "bob");
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        // Sending after close is silently dropped
        conn.send("{}".to_string());
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();
        // Port 9 (discard) is closed on test machines
        let transport = WsTransport::new("ws://127.0.0.1:9");
        let cred = Credential::new("tok").unwrap();

        let _conn = transport.open(&key("bob"), &cred, EventSink::new(3, tx)).unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.generation, 3);
        assert!(matches!(
            event.kind,
            SessionEventKind::Transport(TransportEvent::Error(_))
        ));
    }
}
