use std::sync::Arc;

use async_trait::async_trait;
use shared::domain::{Attachment, ChannelId, ChatMessage, MessageId, UserId};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    config::SessionSettings,
    connection::{ConnectionState, HandshakeCancel, LiveConnectionManager, LiveEvent, LiveEventSink},
    error::SessionError,
    history::{HistoryLoad, HistorySource, HttpHistorySource, MissingHistorySource},
    outbound::{OutboundAction, OutboundEncoder},
    reconciler::{LiveOutcome, MessageReconciler, ReactionOutcome},
};

/// Who is using the session; supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MessagesUpdated { channel_id: ChannelId },
    HistoryUnavailable { channel_id: ChannelId, reason: String },
    ConnectionError { channel_id: ChannelId, reason: String },
}

struct SessionState {
    generation: u64,
    active_channel: Option<ChannelId>,
    reconciler: MessageReconciler,
    history: Option<HistoryLoad>,
}

impl SessionState {
    /// Ends the current activation: bumps the generation, cancels history
    /// and wipes the view.
    fn retire(&mut self, next: Option<ChannelId>) -> u64 {
        self.generation += 1;
        self.history = None;
        self.reconciler.reset();
        self.active_channel = next;
        self.generation
    }
}

pub struct SessionController {
    identity: SessionIdentity,
    encoder: OutboundEncoder,
    history_source: Arc<dyn HistorySource>,
    state: Arc<Mutex<SessionState>>,
    connection: Mutex<LiveConnectionManager>,
    handshake_cancel: Arc<HandshakeCancel>,
    connection_state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Fetches history over HTTP from `server_url`. With no `server_url` the
    /// session runs live-only against `ws_url`.
    pub fn new(settings: &SessionSettings, identity: SessionIdentity) -> anyhow::Result<Self> {
        let history: Arc<dyn HistorySource> = if settings.server_url.trim().is_empty() {
            warn!("session: no server_url configured, history disabled");
            Arc::new(MissingHistorySource)
        } else {
            Arc::new(HttpHistorySource::new(
                settings.server_url.clone(),
                settings.auth_token.clone(),
                settings.history_timeout(),
            )?)
        };
        Self::with_history_source(settings, identity, history)
    }

    pub fn with_history_source(
        settings: &SessionSettings,
        identity: SessionIdentity,
        history_source: Arc<dyn HistorySource>,
    ) -> anyhow::Result<Self> {
        let connection = LiveConnectionManager::new(
            settings.resolved_ws_url()?,
            settings.connect_timeout(),
            settings.close_timeout(),
        );
        let connection_state = connection.subscribe();
        let handshake_cancel = connection.handshake_cancel();
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            encoder: OutboundEncoder::new(identity.user_id),
            identity,
            history_source,
            state: Arc::new(Mutex::new(SessionState {
                generation: 0,
                active_channel: None,
                reconciler: MessageReconciler::new(
                    settings.reaction_window,
                    settings.reaction_capacity,
                ),
                history: None,
            })),
            connection: Mutex::new(connection),
            handshake_cancel,
            connection_state,
            events,
        })
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn is_own_message(&self, message: &ChatMessage) -> bool {
        message.author.id == self.identity.user_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.borrow()
    }

    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.state.lock().await.active_channel
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.reconciler.snapshot()
    }

    pub async fn history_loaded(&self) -> bool {
        self.state.lock().await.reconciler.history_applied()
    }

    /// Makes `channel_id` the viewed channel. Re-selecting the active channel
    /// is a no-op unless its connection failed, in which case the channel is
    /// reloaded from scratch.
    pub async fn select_channel(&self, channel_id: ChannelId) -> Result<(), SessionError> {
        if self.connection_state() != ConnectionState::Joined(channel_id) {
            self.handshake_cancel.cancel();
        }
        let epoch = self.handshake_cancel.epoch();
        let mut connection = self.connection.lock().await;
        if self.active_channel().await == Some(channel_id) && connection.is_joined_to(channel_id)
        {
            debug!(channel_id = channel_id.0, "session: channel already active");
            return Ok(());
        }

        let generation = self.state.lock().await.retire(Some(channel_id));
        connection.teardown().await;

        self.start_history(channel_id, generation).await;

        let sink = Arc::new(ActivationSink {
            generation,
            channel_id,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        });
        if let Err(err) = connection.join(channel_id, sink, epoch).await {
            if matches!(err, SessionError::Cancelled) {
                debug!(channel_id = channel_id.0, "session: activation superseded");
                return Err(err);
            }
            let _ = self.events.send(SessionEvent::ConnectionError {
                channel_id,
                reason: err.to_string(),
            });
            return Err(err);
        }

        info!(channel_id = channel_id.0, generation, "session: channel activated");
        Ok(())
    }

    /// Releases the connection and discards all channel state. Safe to call
    /// repeatedly and from error paths.
    pub async fn deactivate(&self) {
        self.handshake_cancel.cancel();
        let mut connection = self.connection.lock().await;
        let previous = {
            let mut state = self.state.lock().await;
            let previous = state.active_channel;
            state.retire(None);
            previous
        };
        connection.teardown().await;
        if let Some(channel_id) = previous {
            info!(channel_id = channel_id.0, "session: deactivated");
        }
    }

    pub async fn send_text(&self, body: &str) -> Result<(), SessionError> {
        self.send_action(OutboundAction::Text(body.to_string()))
            .await
    }

    pub async fn send_attachment(
        &self,
        attachment: Attachment,
        caption: Option<String>,
    ) -> Result<(), SessionError> {
        self.send_action(OutboundAction::Attachment {
            attachment,
            caption,
        })
        .await
    }

    pub async fn send_reaction(&self, message_id: MessageId, emoji: &str) -> Result<(), SessionError> {
        self.send_action(OutboundAction::Reaction {
            message_id,
            emoji: emoji.to_string(),
        })
        .await
    }

    async fn send_action(&self, action: OutboundAction) -> Result<(), SessionError> {
        action.validate()?;
        let channel_id = self
            .active_channel()
            .await
            .ok_or(SessionError::NotConnected)?;
        // Fail fast while a handshake holds the connection lock.
        if self.connection_state() != ConnectionState::Joined(channel_id) {
            return Err(SessionError::NotConnected);
        }

        let mut connection = self.connection.lock().await;
        if self.active_channel().await != Some(channel_id) {
            return Err(SessionError::NotConnected);
        }
        let frame = self.encoder.encode(channel_id, action)?;
        if let Err(err) = connection.send(channel_id, &frame).await {
            if let SessionError::ConnectionError { reason, .. } = &err {
                let _ = self.events.send(SessionEvent::ConnectionError {
                    channel_id,
                    reason: reason.clone(),
                });
            }
            return Err(err);
        }
        debug!(channel_id = channel_id.0, "session: frame sent");
        Ok(())
    }

    async fn start_history(&self, channel_id: ChannelId, generation: u64) {
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let load = HistoryLoad::spawn(
            Arc::clone(&self.history_source),
            channel_id,
            move |result| async move {
                let mut guard = state.lock().await;
                if guard.generation != generation {
                    debug!(
                        channel_id = channel_id.0,
                        generation, "history: discarding result for retired activation"
                    );
                    return;
                }
                match result {
                    Ok(messages) => {
                        info!(
                            channel_id = channel_id.0,
                            count = messages.len(),
                            "history: loaded"
                        );
                        guard.reconciler.apply_history(messages);
                    }
                    Err(source) => {
                        let err = SessionError::HistoryUnavailable {
                            channel_id: channel_id.0,
                            source,
                        };
                        warn!(error = %err, "history: continuing without backlog");
                        guard.reconciler.apply_history(Vec::new());
                        let _ = events.send(SessionEvent::HistoryUnavailable {
                            channel_id,
                            reason: err.to_string(),
                        });
                    }
                }
                let _ = events.send(SessionEvent::MessagesUpdated { channel_id });
            },
        );

        let mut guard = self.state.lock().await;
        if guard.generation == generation {
            guard.history = Some(load);
        }
    }
}

/// Routes live events of one activation into the session state.
struct ActivationSink {
    generation: u64,
    channel_id: ChannelId,
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl LiveEventSink for ActivationSink {
    async fn deliver(&self, event: LiveEvent) {
        let mut state = self.state.lock().await;
        if state.generation != self.generation {
            debug!(
                channel_id = self.channel_id.0,
                generation = self.generation,
                "session: discarding event from retired activation"
            );
            return;
        }

        let changed = match event {
            LiveEvent::Message(message) => {
                let message_id = message.id.map(|id| id.0);
                let outcome = state.reconciler.apply_live(message);
                if outcome == LiveOutcome::Duplicate {
                    debug!(channel_id = self.channel_id.0, ?message_id, "session: duplicate message ignored");
                }
                outcome != LiveOutcome::Duplicate
            }
            LiveEvent::Reaction(reaction) => {
                let message_id = reaction.message_id.0;
                match state.reconciler.apply_reaction(reaction) {
                    ReactionOutcome::Applied => true,
                    ReactionOutcome::Buffered => {
                        debug!(channel_id = self.channel_id.0, message_id, "session: buffering reaction for unknown message");
                        false
                    }
                    ReactionOutcome::Unchanged | ReactionOutcome::Dropped => false,
                }
            }
            LiveEvent::Disconnected { reason } => {
                let _ = self.events.send(SessionEvent::ConnectionError {
                    channel_id: self.channel_id,
                    reason,
                });
                false
            }
        };

        if changed {
            let _ = self.events.send(SessionEvent::MessagesUpdated {
                channel_id: self.channel_id,
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
