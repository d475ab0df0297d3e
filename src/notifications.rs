//! Shared push-notification channel.
//!
//! One hub connection serves every registered device. The channel owns the
//! connection and its [`ConnectionState`], subscribes to the device-change
//! topic, and forwards `Notify` payloads untouched. Reconnect backoff belongs
//! to the transport; the channel only mirrors what the transport reports.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::api::CredentialProvider;
use crate::protocol::{
    NOTIFICATION_TOPIC, NOTIFY_EVENT, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD, notification_url,
};
use crate::types::ConnectionState;
use crate::{Error, Result};

/// What a live hub connection reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Server-to-client hub method call.
    Invocation { target: String, arguments: Vec<Value> },
    Reconnecting(Option<String>),
    Reconnected(Option<String>),
    /// The transport gave up. No further events follow.
    Closed(Option<String>),
}

#[async_trait]
pub trait HubConnection: Send + Sync {
    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value>;
    async fn stop(&self) -> Result<()>;
}

/// Opens hub connections. Implementations own reconnect and backoff.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// A rejected token must surface as [`Error::Unauthorized`].
    async fn connect(
        &self,
        url: Url,
    ) -> Result<(Arc<dyn HubConnection>, mpsc::UnboundedReceiver<TransportEvent>)>;
}

/// Channel output consumed by the synchronizer's coordinator loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChannelEvent {
    Notification(Value),
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    CredentialsExpired,
}

struct Status {
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Status {
    fn get(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            info!(%from, %to, "notification channel state changed");
            self.forward(ChannelEvent::StateChanged { from, to });
        }
    }

    fn forward(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

pub(crate) struct NotificationChannel {
    transport: Arc<dyn NotificationTransport>,
    credentials: Arc<dyn CredentialProvider>,
    api_url: String,
    status: Arc<Status>,
    connection: Option<Arc<dyn HubConnection>>,
    pump: Option<JoinHandle<()>>,
}

impl NotificationChannel {
    pub fn new(
        transport: Arc<dyn NotificationTransport>,
        credentials: Arc<dyn CredentialProvider>,
        api_url: impl Into<String>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            credentials,
            api_url: api_url.into(),
            status: Arc::new(Status { state, events }),
            connection: None,
            pump: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.get()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.status.state.subscribe()
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.state().is_running() {
            trace!(state = %self.state(), "start ignored");
            return Ok(());
        }
        self.drop_stale();

        // Read per attempt; never kept past this connection.
        let Some(token) = self.credentials.access_token() else {
            self.status.set(ConnectionState::Disconnected);
            return Err(Error::NoCredentials);
        };
        let url = notification_url(&self.api_url, &token)?;

        self.status.set(ConnectionState::Connecting);
        let (connection, events) = match self.transport.connect(url).await {
            Ok(pair) => pair,
            Err(e) => return Err(self.fail(e)),
        };

        if let Err(e) = subscribe(connection.as_ref()).await {
            if let Err(stop_err) = connection.stop().await {
                debug!(error = %stop_err, "stopping connection after failed subscribe");
            }
            return Err(self.fail(e));
        }

        self.status.set(ConnectionState::Connected);
        self.pump = Some(tokio::spawn(pump(
            events,
            connection.clone(),
            self.status.clone(),
        )));
        self.connection = Some(connection);
        Ok(())
    }

    pub async fn stop(&mut self) {
        let state = self.state();
        if matches!(state, ConnectionState::Disconnected | ConnectionState::Closed) {
            self.drop_stale();
            return;
        }

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(connection) = self.connection.take() {
            if state == ConnectionState::Connected
                && let Err(e) = connection.invoke(UNSUBSCRIBE_METHOD, topic_args()).await
            {
                warn!(error = %e, "unsubscribe failed");
            }
            if let Err(e) = connection.stop().await {
                warn!(error = %e, "stopping hub connection failed");
            }
        }
        self.status.set(ConnectionState::Disconnected);
    }

    /// Handshake failure. A rejected token asks for a refresh instead of
    /// leaving the channel closed.
    fn fail(&self, e: Error) -> Error {
        if matches!(e, Error::Unauthorized) {
            info!("notification hub rejected the access token");
            self.status.forward(ChannelEvent::CredentialsExpired);
            self.status.set(ConnectionState::Disconnected);
        } else {
            warn!(error = %e, "notification channel failed to start");
            self.status.set(ConnectionState::Closed);
        }
        e
    }

    fn drop_stale(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.connection = None;
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn topic_args() -> Vec<Value> {
    vec![json!([NOTIFICATION_TOPIC])]
}

async fn subscribe(connection: &dyn HubConnection) -> Result<()> {
    connection.invoke(SUBSCRIBE_METHOD, topic_args()).await?;
    debug!(topic = NOTIFICATION_TOPIC, "subscribed to device notifications");
    Ok(())
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    connection: Arc<dyn HubConnection>,
    status: Arc<Status>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Invocation {
                target,
                mut arguments,
            } if target == NOTIFY_EVENT => {
                let payload = if arguments.is_empty() {
                    Value::Null
                } else {
                    arguments.swap_remove(0)
                };
                status.forward(ChannelEvent::Notification(payload));
            }
            TransportEvent::Invocation { target, .. } => {
                trace!(method = %target, "ignoring hub invocation");
            }
            TransportEvent::Reconnecting(error) => {
                debug!(?error, "hub connection lost");
                status.set(ConnectionState::Reconnecting);
            }
            TransportEvent::Reconnected(connection_id) => {
                debug!(?connection_id, "hub connection restored");
                if let Err(e) = subscribe(connection.as_ref()).await {
                    warn!(error = %e, "re-subscribe after reconnect failed");
                }
                status.set(ConnectionState::Connected);
            }
            TransportEvent::Closed(error) => {
                debug!(?error, "hub connection closed");
                status.set(ConnectionState::Closed);
                return;
            }
        }
    }
    status.set(ConnectionState::Closed);
}
