//! WebSocket transport
//!
//! Speaks the popsub JSON protocol as a client. Responsibilities:
//! - open the WebSocket and, when the endpoint has credentials, run the
//!   login -> auth handshake before handing the connection out
//! - map per-token subscriptions onto per-topic protocol subscriptions
//! - encode `Message` values into the protocol's string payload and back
//! - report incoming messages and connection loss as `TransportEvent`s
//!
//! Outbound frames go through a channel to a single writer task; a reader
//! task owns the receiving half of the socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use super::message::{ClientMessage, ServerMessage};
use super::{Connection, Endpoint, EventSender, Transport, TransportEvent};
use crate::client::SubscriptionToken;
use crate::message::Message;
use crate::utils::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type TopicsReply = oneshot::Sender<Result<Vec<String>, TransportError>>;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    request_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the handshake steps and `list_destinations` round trips.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn handshake(&self, ws: &mut WsStream, endpoint: &Endpoint) -> Result<(), TransportError> {
        let Some(credentials) = &endpoint.credentials else {
            return Ok(());
        };

        send_frame(
            ws,
            &ClientMessage::Login {
                username: credentials.username.clone(),
                password: credentials.password.clone(),
            },
        )
        .await?;
        let token = match self.next_reply(ws).await? {
            ServerMessage::LoginResponse { token } => token,
            ServerMessage::Error { message } => return Err(TransportError::connect(message)),
            other => {
                return Err(TransportError::protocol(format!(
                    "expected login_response, got {other:?}"
                )));
            }
        };

        send_frame(ws, &ClientMessage::Auth { token }).await?;
        match self.next_reply(ws).await? {
            ServerMessage::Authenticated {} => Ok(()),
            ServerMessage::Error { message } => Err(TransportError::connect(message)),
            other => Err(TransportError::protocol(format!(
                "expected authenticated, got {other:?}"
            ))),
        }
    }

    async fn next_reply(&self, ws: &mut WsStream) -> Result<ServerMessage, TransportError> {
        let read = async {
            while let Some(frame) = ws.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        return serde_json::from_str::<ServerMessage>(text.as_str())
                            .map_err(|e| TransportError::protocol(e.to_string()));
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::connect(e.to_string())),
                }
            }
            Err(TransportError::connect("connection closed during handshake"))
        };
        tokio::time::timeout(self.request_timeout, read)
            .await
            .map_err(|_| TransportError::Timeout("handshake".to_string()))?
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ClientMessage) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame).map_err(|e| TransportError::protocol(e.to_string()))?;
    ws.send(WsMessage::text(text))
        .await
        .map_err(|e| TransportError::connect(e.to_string()))
}

/// Message -> protocol payload. The JSON envelope keeps type and headers.
pub fn encode_payload(message: &Message) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::protocol(e.to_string()))
}

/// Protocol payload -> Message. Payloads from producers that do not use the
/// envelope arrive as plain text.
pub fn decode_payload(payload: &str) -> Message {
    serde_json::from_str::<Message>(payload).unwrap_or_else(|_| Message::text(payload))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSender,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let url = format!("ws://{}", endpoint.address());
        let (mut ws, _response) = tokio::time::timeout(self.request_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {url}")))?
            .map_err(|e| TransportError::connect(e.to_string()))?;

        self.handshake(&mut ws, endpoint).await?;
        info!("WebSocket connection to {} established", url);

        let (mut ws_sender, ws_receiver) = ws.split();
        let (outbound, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let shared = Arc::new(Shared {
            outbound,
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("WebSocket send loop stopped: {e}");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });
        tokio::spawn(read_loop(ws_receiver, Arc::clone(&shared), events));

        Ok(Arc::new(WebSocketConnection {
            shared,
            request_timeout: self.request_timeout,
        }))
    }
}

struct Shared {
    outbound: mpsc::UnboundedSender<WsMessage>,
    // topic -> tokens subscribed to it, in subscription order
    routes: Mutex<HashMap<String, Vec<SubscriptionToken>>>,
    // list_topics requests awaiting a reply, oldest first. popsub frames
    // carry no request id, so an `error` frame that arrives while a request
    // is pending is taken as that request's answer. With nothing pending it
    // is only logged.
    pending: Mutex<VecDeque<TopicsReply>>,
    closed: AtomicBool,
}

impl Shared {
    fn push(&self, frame: &ClientMessage) -> Result<(), TransportError> {
        let text = serde_json::to_string(frame).map_err(|e| TransportError::protocol(e.to_string()))?;
        self.outbound
            .send(WsMessage::text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, Vec<SubscriptionToken>>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<TopicsReply>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle_text(&self, text: &str, events: &EventSender) {
        let frame = match serde_json::from_str::<ServerMessage>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    "Invalid server frame: {err} | {}",
                    text.chars().take(100).collect::<String>()
                );
                return;
            }
        };

        match frame {
            ServerMessage::Message {
                topic,
                payload,
                message_id,
                qos,
                ..
            } => {
                let tokens = self.routes().get(&topic).cloned().unwrap_or_default();
                let message = decode_payload(&payload);
                for token in tokens {
                    let _ = events.send(TransportEvent::Message {
                        token,
                        message: message.clone(),
                    });
                }
                if qos == 1 {
                    if let Err(e) = self.push(&ClientMessage::Ack { message_id }) {
                        debug!("Could not ack message on {topic}: {e}");
                    }
                }
            }
            ServerMessage::Topics { topics } => match self.pending().pop_front() {
                Some(reply) => {
                    let _ = reply.send(Ok(topics));
                }
                None => debug!("Unsolicited topics frame"),
            },
            ServerMessage::Error { message } => match self.pending().pop_front() {
                Some(reply) => {
                    let _ = reply.send(Err(TransportError::protocol(message)));
                }
                None => warn!("Broker reported error: {message}"),
            },
            other => debug!("Ignoring server frame {other:?}"),
        }
    }
}

async fn read_loop(mut ws_receiver: SplitStream<WsStream>, shared: Arc<Shared>, events: EventSender) {
    let mut cause = "connection closed by broker".to_string();
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => shared.handle_text(text.as_str(), &events),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                cause = e.to_string();
                break;
            }
        }
    }

    for reply in shared.pending().drain(..) {
        let _ = reply.send(Err(TransportError::Closed));
    }
    if !shared.closed.load(Ordering::SeqCst) {
        let _ = events.send(TransportEvent::ConnectionLost { cause });
    }
}

struct WebSocketConnection {
    shared: Arc<Shared>,
    request_timeout: Duration,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&self, topic: &str, message: &Message) -> Result<(), TransportError> {
        let payload = encode_payload(message)?;
        self.shared
            .push(&ClientMessage::Publish {
                topic: topic.to_string(),
                payload,
                message_id: None,
                qos: None,
            })
            .map_err(|e| TransportError::send(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, token: SubscriptionToken) -> Result<(), TransportError> {
        let first = {
            let mut routes = self.shared.routes();
            let tokens = routes.entry(topic.to_string()).or_default();
            if !tokens.contains(&token) {
                tokens.push(token);
            }
            tokens.len() == 1
        };
        if !first {
            return Ok(());
        }

        let result = self.shared.push(&ClientMessage::Subscribe {
            topic: topic.to_string(),
        });
        if let Err(e) = result {
            self.shared.routes().remove(topic);
            return Err(TransportError::subscribe(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), TransportError> {
        let emptied = {
            let mut routes = self.shared.routes();
            let topic = routes
                .iter()
                .find(|(_, tokens)| tokens.contains(&token))
                .map(|(topic, _)| topic.clone());
            match topic {
                Some(topic) => {
                    let tokens = routes.entry(topic.clone()).or_default();
                    tokens.retain(|t| *t != token);
                    if tokens.is_empty() {
                        routes.remove(&topic);
                        Some(topic)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        match emptied {
            Some(topic) => self.shared.push(&ClientMessage::Unsubscribe { topic }),
            None => Ok(()),
        }
    }

    async fn list_destinations(&self) -> Result<Vec<String>, TransportError> {
        let (reply, rx) = oneshot::channel();
        {
            // queue the reply slot before the request can be answered
            let mut pending = self.shared.pending();
            pending.push_back(reply);
            self.shared.push(&ClientMessage::ListTopics)?;
        }

        let mut topics = tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| TransportError::Timeout("list_topics".to_string()))?
            .map_err(|_| TransportError::Closed)??;
        topics.sort();
        Ok(topics)
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.shared.outbound.send(WsMessage::Close(None));
    }
}
