//! SignalR client (JSON hub protocol over WebSocket).
//!
//! Covers what the notification hub needs: negotiate, handshake, client and
//! server invocations, completions, keep-alive, and automatic reconnect with a
//! fixed delay schedule. Streaming is not supported.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::notifications::{HubConnection, NotificationTransport, TransportEvent};
use crate::{Error, Result};

const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const COMPLETION: u64 = 3;
const PING: u64 = 6;
const CLOSE: u64 = 7;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const SERVER_TIMEOUT: Duration = Duration::from_secs(30);
const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;

/// Default retry schedule: immediately, then after 2, 10 and 30 seconds.
const DEFAULT_RECONNECT_DELAYS: [Duration; 4] = [
    Duration::from_secs(0),
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct SignalRTransport {
    http: reqwest::Client,
    reconnect_delays: Vec<Duration>,
}

impl Default for SignalRTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalRTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            reconnect_delays: DEFAULT_RECONNECT_DELAYS.to_vec(),
        }
    }

    /// Replace the retry schedule. An empty schedule closes on first loss.
    pub fn reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }
}

#[async_trait]
impl NotificationTransport for SignalRTransport {
    async fn connect(
        &self,
        url: Url,
    ) -> Result<(Arc<dyn HubConnection>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let opened = open(&self.http, &url).await?;
        info!(connection_id = ?opened.connection_id, "hub connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let session = Session {
            http: self.http.clone(),
            hub: url,
            delays: self.reconnect_delays.clone(),
            events: events_tx,
            pending: pending.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(run(session, opened, outbound_rx));

        let connection = SignalRConnection {
            outbound: outbound_tx,
            pending,
            cancel,
        };
        Ok((Arc::new(connection), events_rx))
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

struct SignalRConnection {
    outbound: mpsc::UnboundedSender<String>,
    pending: Pending,
    cancel: CancellationToken,
}

#[async_trait]
impl HubConnection for SignalRConnection {
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        let record = encode_record(&json!({
            "type": INVOCATION,
            "invocationId": id,
            "target": method,
            "arguments": arguments,
        }))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        if self.outbound.send(record).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Transport("hub connection is closed".into()));
        }
        trace!(method, invocation_id = %id, "invoking hub method");

        match tokio::time::timeout(INVOKE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport(format!(
                "connection lost before {method} completed"
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Transport(format!("{method} timed out")))
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

impl Drop for SignalRConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    http: reqwest::Client,
    hub: Url,
    delays: Vec<Duration>,
    events: mpsc::UnboundedSender<TransportEvent>,
    pending: Pending,
    cancel: CancellationToken,
}

impl Session {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with a closed-channel error.
        self.pending.lock().clear();
    }

    fn dispatch(&self, message: HubMessage) -> Option<Disconnect> {
        match message {
            HubMessage::Invocation { target, arguments } => {
                self.emit(TransportEvent::Invocation { target, arguments });
            }
            HubMessage::Completion {
                invocation_id,
                result,
            } => match self.pending.lock().remove(&invocation_id) {
                Some(waiter) => {
                    let _ = waiter.send(result.map_err(Error::Transport));
                }
                None => trace!(%invocation_id, "completion for unknown invocation"),
            },
            HubMessage::Ping => trace!("hub ping"),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                return Some(if allow_reconnect {
                    Disconnect::Lost(error.unwrap_or_else(|| "server closed the connection".into()))
                } else {
                    Disconnect::Closed(error)
                });
            }
            HubMessage::Other(kind) => trace!(kind, "ignoring hub message"),
        }
        None
    }
}

enum Disconnect {
    Stopped,
    Lost(String),
    Closed(Option<String>),
}

async fn run(session: Session, mut opened: Opened, mut outbound: mpsc::UnboundedReceiver<String>) {
    loop {
        match drive(opened, &session, &mut outbound).await {
            Disconnect::Stopped => {
                debug!("hub connection stopped");
                session.fail_pending();
                return;
            }
            Disconnect::Closed(error) => {
                info!(?error, "hub closed the connection");
                session.fail_pending();
                session.emit(TransportEvent::Closed(error));
                return;
            }
            Disconnect::Lost(reason) => {
                warn!(%reason, "hub connection lost");
                session.fail_pending();
                session.emit(TransportEvent::Reconnecting(Some(reason)));
                match reconnect(&session).await {
                    Some(next) => {
                        info!(connection_id = ?next.connection_id, "hub reconnected");
                        session.emit(TransportEvent::Reconnected(next.connection_id.clone()));
                        opened = next;
                    }
                    None if session.cancel.is_cancelled() => return,
                    None => {
                        session.emit(TransportEvent::Closed(Some(
                            "reconnect attempts exhausted".into(),
                        )));
                        return;
                    }
                }
            }
        }
    }
}

async fn drive(
    opened: Opened,
    session: &Session,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> Disconnect {
    let (mut sink, mut stream) = opened.socket.split();

    for message in opened.backlog {
        if let Some(disconnect) = session.dispatch(message) {
            return disconnect;
        }
    }

    let mut keep_alive = interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
    let mut last_received = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Disconnect::Stopped;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_received = Instant::now();
                    for message in parse_frame(text.as_str()) {
                        if let Some(disconnect) = session.dispatch(message) {
                            return disconnect;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("close frame {}: {}", f.code, f.reason.as_str()))
                        .unwrap_or_else(|| "close frame".into());
                    return Disconnect::Lost(reason);
                }
                Some(Ok(_)) => last_received = Instant::now(),
                Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                None => return Disconnect::Lost("stream ended".into()),
            },
            record = outbound.recv() => match record {
                Some(record) => {
                    if let Err(e) = sink.send(Message::Text(record.into())).await {
                        return Disconnect::Lost(e.to_string());
                    }
                }
                // Every connection handle is gone.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Disconnect::Stopped;
                }
            },
            _ = keep_alive.tick() => {
                if last_received.elapsed() > SERVER_TIMEOUT {
                    return Disconnect::Lost("server timeout".into());
                }
                let ping = format!("{{\"type\":{PING}}}{RECORD_SEPARATOR}");
                if let Err(e) = sink.send(Message::Text(ping.into())).await {
                    return Disconnect::Lost(e.to_string());
                }
            }
        }
    }
}

async fn reconnect(session: &Session) -> Option<Opened> {
    for (attempt, delay) in session.delays.iter().enumerate() {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => return None,
            _ = tokio::time::sleep(*delay) => {}
        }
        match open(&session.http, &session.hub).await {
            Ok(opened) => return Some(opened),
            Err(e) => debug!(attempt, error = %e, "reconnect attempt failed"),
        }
    }
    None
}

struct Opened {
    socket: WsStream,
    connection_id: Option<String>,
    /// Messages that arrived in the same frame as the handshake response.
    backlog: Vec<HubMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

async fn open(http: &reqwest::Client, hub: &Url) -> Result<Opened> {
    let mut hub = hub.clone();
    let mut bearer: Option<String> = None;

    for _ in 0..=MAX_REDIRECTS {
        let negotiated = negotiate(http, &hub, bearer.as_deref()).await?;
        if let Some(error) = negotiated.error {
            return Err(Error::Protocol(format!("negotiate failed: {error}")));
        }
        if let Some(redirect) = negotiated.url {
            debug!(url = %redirect, "negotiate redirect");
            hub = Url::parse(&redirect)
                .map_err(|e| Error::Protocol(format!("invalid redirect url {redirect}: {e}")))?;
            bearer = negotiated.access_token;
            continue;
        }
        if !negotiated
            .available_transports
            .iter()
            .any(|t| t.transport == "WebSockets")
        {
            return Err(Error::Protocol("hub does not offer WebSockets".into()));
        }

        let token = negotiated
            .connection_token
            .as_deref()
            .or(negotiated.connection_id.as_deref());
        let ws_url = websocket_url(&hub, token)?;
        let (socket, backlog) = handshake(&ws_url, bearer.as_deref()).await?;
        return Ok(Opened {
            socket,
            connection_id: negotiated.connection_id,
            backlog,
        });
    }
    Err(Error::Protocol("too many negotiate redirects".into()))
}

async fn negotiate(
    http: &reqwest::Client,
    hub: &Url,
    bearer: Option<&str>,
) -> Result<NegotiateResponse> {
    let url = negotiate_url(hub);
    debug!(url = %url.path(), "negotiating hub connection");

    let mut request = http.post(url).header(reqwest::header::CONTENT_LENGTH, 0);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let resp = request.send().await?;
    let status = resp.status().as_u16();
    match status {
        200..=299 => Ok(resp.json().await?),
        401 => Err(Error::Unauthorized),
        s if (500..600).contains(&s) => Err(Error::Server(s)),
        s => Err(Error::Status {
            status: s,
            message: None,
        }),
    }
}

async fn handshake(url: &Url, bearer: Option<&str>) -> Result<(WsStream, Vec<HubMessage>)> {
    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::Transport(e.to_string()))?;
    let mut request = ClientRequestBuilder::new(uri);
    if let Some(token) = bearer {
        request = request.with_header("Authorization", format!("Bearer {token}"));
    }

    let (mut socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(ws_error)?;

    let request = encode_record(&json!({"protocol": "json", "version": 1}))?;
    socket
        .send(Message::Text(request.into()))
        .await
        .map_err(ws_error)?;

    loop {
        let frame = tokio::time::timeout(SERVER_TIMEOUT, socket.next())
            .await
            .map_err(|_| Error::Transport("handshake timed out".into()))?;
        match frame {
            Some(Ok(Message::Text(text))) => {
                let (response, rest) = split_handshake(text.as_str())?;
                if let Some(error) = response.get("error").and_then(Value::as_str) {
                    return Err(Error::Protocol(format!("handshake rejected: {error}")));
                }
                return Ok((socket, parse_frame(rest)));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Transport("connection closed during handshake".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ws_error(e)),
        }
    }
}

fn ws_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::Http(ref response) if response.status().as_u16() == 401 => {
            Error::Unauthorized
        }
        other => Error::Transport(other.to_string()),
    }
}

fn negotiate_url(hub: &Url) -> Url {
    let mut url = hub.clone();
    let path = format!("{}/negotiate", hub.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    url
}

fn websocket_url(hub: &Url, connection_token: Option<&str>) -> Result<Url> {
    let scheme = match hub.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(Error::Protocol(format!("unsupported hub scheme {other}"))),
    };
    let mut url = hub.clone();
    url.set_scheme(scheme)
        .map_err(|_| Error::Protocol(format!("cannot use {scheme} for {hub}")))?;
    if let Some(id) = connection_token {
        url.query_pairs_mut().append_pair("id", id);
    }
    Ok(url)
}

fn encode_record(message: &Value) -> Result<String> {
    let mut record = serde_json::to_string(message)?;
    record.push(RECORD_SEPARATOR);
    Ok(record)
}

/// Split off the handshake response; whatever follows is regular traffic.
fn split_handshake(text: &str) -> Result<(Value, &str)> {
    let (first, rest) = text
        .split_once(RECORD_SEPARATOR)
        .ok_or_else(|| Error::Protocol("unterminated handshake response".into()))?;
    let response = serde_json::from_str(first)
        .map_err(|e| Error::Protocol(format!("invalid handshake response: {e}")))?;
    Ok((response, rest))
}

#[derive(Debug, Clone, PartialEq)]
enum HubMessage {
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: std::result::Result<Value, String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    Other(u64),
}

fn parse_frame(text: &str) -> Vec<HubMessage> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.is_empty())
        .filter_map(|record| match serde_json::from_str::<Value>(record) {
            Ok(value) => parse_message(&value),
            Err(e) => {
                debug!(error = %e, "dropping malformed hub record");
                None
            }
        })
        .collect()
}

fn parse_message(value: &Value) -> Option<HubMessage> {
    let kind = value.get("type")?.as_u64()?;
    let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

    let message = match kind {
        INVOCATION => HubMessage::Invocation {
            target: text("target")?,
            arguments: value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        },
        COMPLETION => HubMessage::Completion {
            invocation_id: text("invocationId")?,
            result: match text("error") {
                Some(error) => Err(error),
                None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
            },
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close {
            error: text("error"),
            allow_reconnect: value
                .get("allowReconnect")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        other => HubMessage::Other(other),
    };
    Some(message)
}
