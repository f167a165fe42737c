//! Streaming push channel.
//!
//! A single WebSocket carries every subscribed topic. Messages arrive as an
//! envelope naming the topic (`stream`), the event kind and a payload, which
//! is a JSON-encoded string for object payloads and a bare id for deletes.
//! The client reconnects with exponential backoff and re-subscribes every
//! topic the router still needs.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::entity::{chat_message_from_json, notification_from_json, status_from_json};
use crate::router::EventRouter;
use crate::{FeedError, ItemRef, StreamTopic};

/// Capacity of the subscription command channel.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Longest silence tolerated before the connection is considered dead.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on the reconnect delay.
const MAX_BACKOFF_SECS: u64 = 60;

/// Envelope of one streaming message.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamMessage {
    #[serde(default)]
    pub stream: Vec<String>,
    pub event: String,
    #[serde(default)]
    pub payload: Option<String>,
}

/// The closed vocabulary of streaming event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Update,
    StatusUpdate,
    Notification,
    Delete,
    Conversation,
    Announcement,
    AnnouncementReaction,
    AnnouncementDelete,
    FiltersChanged,
    Marker,
    ChatMessageCreated,
    ChatMessageDeleted,
    FollowRelationshipsUpdate,
    EncryptedMessage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::StatusUpdate => "status.update",
            EventKind::Notification => "notification",
            EventKind::Delete => "delete",
            EventKind::Conversation => "conversation",
            EventKind::Announcement => "announcement",
            EventKind::AnnouncementReaction => "announcement.reaction",
            EventKind::AnnouncementDelete => "announcement.delete",
            EventKind::FiltersChanged => "filters_changed",
            EventKind::Marker => "marker",
            EventKind::ChatMessageCreated => "chat_message.created",
            EventKind::ChatMessageDeleted => "chat_message.deleted",
            EventKind::FollowRelationshipsUpdate => "follow_relationships_update",
            EventKind::EncryptedMessage => "encrypted_message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "update" => EventKind::Update,
            "status.update" => EventKind::StatusUpdate,
            "notification" => EventKind::Notification,
            "delete" => EventKind::Delete,
            "conversation" => EventKind::Conversation,
            "announcement" => EventKind::Announcement,
            "announcement.reaction" => EventKind::AnnouncementReaction,
            "announcement.delete" => EventKind::AnnouncementDelete,
            "filters_changed" => EventKind::FiltersChanged,
            "marker" => EventKind::Marker,
            "chat_message.created" => EventKind::ChatMessageCreated,
            "chat_message.deleted" => EventKind::ChatMessageDeleted,
            "follow_relationships_update" => EventKind::FollowRelationshipsUpdate,
            "encrypted_message" => EventKind::EncryptedMessage,
            other => return Err(FeedError::UnknownEvent(other.to_string())),
        };
        Ok(kind)
    }
}

/// A decoded push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// A new status on a timeline topic.
    Update(ItemRef),
    /// An edited status; refreshes the cache only.
    StatusUpdate(ItemRef),
    Notification(ItemRef),
    /// A deleted status id.
    Delete(String),
    ChatMessageCreated { chat_id: String, item: ItemRef },
    /// A deleted chat message id.
    ChatMessageDeleted(String),
    /// A known kind the engine does not act on.
    Ignored(EventKind),
}

fn payload_json(kind: EventKind, payload: Option<&str>) -> Result<Value, FeedError> {
    let raw = payload.ok_or_else(|| FeedError::InvalidPayload {
        event: kind.to_string(),
        reason: "missing payload".to_string(),
    })?;
    Ok(serde_json::from_str(raw)?)
}

fn payload_id(kind: EventKind, payload: Option<&str>) -> Result<String, FeedError> {
    let raw = payload
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| FeedError::InvalidPayload {
            event: kind.to_string(),
            reason: "missing id".to_string(),
        })?;
    // Some servers JSON-encode the id.
    Ok(raw.trim_matches('"').to_string())
}

impl PushEvent {
    /// Decode an event from its kind string and raw payload.
    pub fn parse(event: &str, payload: Option<&str>) -> Result<Self, FeedError> {
        let kind: EventKind = event.parse()?;
        let parsed = match kind {
            EventKind::Update => PushEvent::Update(status_from_json(&payload_json(kind, payload)?)?),
            EventKind::StatusUpdate => {
                PushEvent::StatusUpdate(status_from_json(&payload_json(kind, payload)?)?)
            }
            EventKind::Notification => {
                PushEvent::Notification(notification_from_json(&payload_json(kind, payload)?)?)
            }
            EventKind::Delete => PushEvent::Delete(payload_id(kind, payload)?),
            EventKind::ChatMessageCreated => {
                let (chat_id, item) = chat_message_from_json(&payload_json(kind, payload)?)?;
                PushEvent::ChatMessageCreated { chat_id, item }
            }
            EventKind::ChatMessageDeleted => PushEvent::ChatMessageDeleted(payload_id(kind, payload)?),
            EventKind::Conversation
            | EventKind::Announcement
            | EventKind::AnnouncementReaction
            | EventKind::AnnouncementDelete
            | EventKind::FiltersChanged
            | EventKind::Marker
            | EventKind::FollowRelationshipsUpdate
            | EventKind::EncryptedMessage => PushEvent::Ignored(kind),
        };
        Ok(parsed)
    }
}

/// Connection state of the streaming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Disconnected,
    Connected,
}

/// Subscription change requested of a running client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Subscribe(StreamTopic),
    Unsubscribe(StreamTopic),
}

/// Cloneable handle for sending subscription changes to a [`StreamingClient`].
#[derive(Debug, Clone)]
pub struct StreamHandle {
    commands_tx: mpsc::Sender<StreamCommand>,
}

impl StreamHandle {
    /// Returns false if the client has stopped.
    ///
    /// Never waits. When the command queue is full the command is dropped;
    /// the router's subscriptions are resent on every connect.
    pub fn subscribe(&self, topic: StreamTopic) -> bool {
        self.send(StreamCommand::Subscribe(topic))
    }

    pub fn unsubscribe(&self, topic: StreamTopic) -> bool {
        self.send(StreamCommand::Unsubscribe(topic))
    }

    fn send(&self, command: StreamCommand) -> bool {
        match self.commands_tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(command)) => {
                warn!(?command, "stream command queue full, dropping command");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// WebSocket streaming client.
pub struct StreamingClient {
    /// Streaming endpoint, without query params.
    url: String,
    access_token: Option<String>,
    router: Arc<EventRouter>,
    commands_rx: Mutex<mpsc::Receiver<StreamCommand>>,
    status_tx: watch::Sender<StreamStatus>,
}

impl StreamingClient {
    pub fn new(url: impl Into<String>, router: Arc<EventRouter>) -> (Self, StreamHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (status_tx, _) = watch::channel(StreamStatus::Disconnected);
        let client = Self {
            url: url.into(),
            access_token: None,
            router,
            commands_rx: Mutex::new(commands_rx),
            status_tx,
        };
        (client, StreamHandle { commands_tx })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Watch the connection state.
    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: StreamStatus) {
        self.status_tx.send_replace(status);
    }

    /// Build the full WebSocket URL with query parameters.
    fn build_url(&self) -> String {
        match &self.access_token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}access_token={}", self.url, sep, token)
            }
            None => self.url.clone(),
        }
    }

    /// Connect and start receiving events.
    ///
    /// Runs in a reconnection loop with exponential backoff until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), FeedError> {
        let mut commands = self.commands_rx.lock().await;
        let mut backoff_secs = 1u64;

        loop {
            if *shutdown_rx.borrow() {
                info!("streaming client shutting down");
                return Ok(());
            }

            info!(url = %self.url, topics = self.router.topics().len(), "connecting to streaming API");

            match self
                .connect_and_process(&mut shutdown_rx, &mut commands, &mut backoff_secs)
                .await
            {
                Ok(()) => {
                    self.set_status(StreamStatus::Disconnected);
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "streaming connection error, reconnecting");
                    self.set_status(StreamStatus::Disconnected);

                    let wait = Duration::from_secs(backoff_secs);
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }

                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    /// Connect and process messages until error or shutdown.
    async fn connect_and_process(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        commands: &mut mpsc::Receiver<StreamCommand>,
        backoff_secs: &mut u64,
    ) -> Result<(), FeedError> {
        let (ws_stream, _) = connect_async(self.build_url())
            .await
            .map_err(|e| FeedError::WebSocket(format!("connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        // Everything queued while offline is covered by the full resubscribe.
        let mut dropped = 0usize;
        while commands.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded subscription changes queued while offline");
        }

        for topic in self.router.topics() {
            let msg = topic.control_message("subscribe").to_string();
            write
                .send(Message::Text(msg))
                .await
                .map_err(|e| FeedError::WebSocket(format!("subscribe failed: {}", e)))?;
            debug!(topic = %topic, "subscribed");
        }

        info!("streaming connected");
        *backoff_secs = 1;
        self.set_status(StreamStatus::Connected);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("streaming client received shutdown signal");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }

                Some(command) = commands.recv() => {
                    let (kind, topic) = match command {
                        StreamCommand::Subscribe(topic) => ("subscribe", topic),
                        StreamCommand::Unsubscribe(topic) => ("unsubscribe", topic),
                    };
                    let msg = topic.control_message(kind).to_string();
                    write
                        .send(Message::Text(msg))
                        .await
                        .map_err(|e| FeedError::WebSocket(format!("{} failed: {}", kind, e)))?;
                    debug!(topic = %topic, kind, "subscription changed");
                }

                result = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Err(e) = self.handle_message(&text).await {
                                warn!(error = %e, "failed to handle streaming message");
                            }
                        }
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            trace!("received ping");
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("streaming connection closed by server");
                            return Err(FeedError::WebSocket("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(FeedError::WebSocket(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(FeedError::WebSocket("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!("streaming read timeout after {}s", READ_TIMEOUT.as_secs());
                            return Err(FeedError::WebSocket("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Handle a single streaming JSON message.
    async fn handle_message(&self, text: &str) -> Result<(), FeedError> {
        let message: StreamMessage = serde_json::from_str(text)?;
        let Some(topic) = StreamTopic::from_stream_array(&message.stream) else {
            trace!(event = %message.event, "ignoring message without stream");
            return Ok(());
        };

        let event = PushEvent::parse(&message.event, message.payload.as_deref())?;
        let routed = self.router.route(&topic, event).await;
        trace!(topic = %topic, event = %message.event, ?routed, "message routed");
        Ok(())
    }
}
