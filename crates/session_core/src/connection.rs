use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{ChannelId, ChatMessage, ReactionEvent},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{
    net::TcpStream,
    sync::{watch, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::SessionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Joined(ChannelId),
    Closing,
    Closed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Message(ChatMessage),
    Reaction(ReactionEvent),
    Disconnected { reason: String },
}

/// Receives events from the reader task of one joined connection.
#[async_trait]
pub trait LiveEventSink: Send + Sync {
    async fn deliver(&self, event: LiveEvent);
}

/// Lets callers that do not hold the manager abort a handshake in flight.
/// Each `cancel` bumps the epoch; a join started under an older epoch gives up.
#[derive(Debug, Default)]
pub struct HandshakeCancel {
    epoch: AtomicU64,
    notify: Notify,
}

impl HandshakeCancel {
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn cancelled(&self, since: u64) {
        let notified = self.notify.notified();
        if self.epoch() != since {
            return;
        }
        notified.await;
    }
}

struct ActiveLink {
    channel_id: ChannelId,
    writer: SplitSink<WsStream, WsMessage>,
    reader: JoinHandle<()>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Owns the single live connection. Callers serialize access; `join` always
/// finishes tearing down the previous link before dialing the next.
pub struct LiveConnectionManager {
    ws_url: String,
    connect_timeout: Duration,
    close_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: Arc<HandshakeCancel>,
    link: Option<ActiveLink>,
}

impl LiveConnectionManager {
    pub fn new(ws_url: impl Into<String>, connect_timeout: Duration, close_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            ws_url: ws_url.into(),
            connect_timeout,
            close_timeout,
            state: Arc::new(state),
            cancel: Arc::new(HandshakeCancel::default()),
            link: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn handshake_cancel(&self) -> Arc<HandshakeCancel> {
        Arc::clone(&self.cancel)
    }

    pub fn is_joined_to(&self, channel_id: ChannelId) -> bool {
        self.state() == ConnectionState::Joined(channel_id)
    }

    pub fn joined_channel(&self) -> Option<ChannelId> {
        self.link.as_ref().map(|link| link.channel_id)
    }

    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, ?next, "live: state transition");
        }
    }

    fn fail(&self, channel_id: ChannelId, reason: String) -> SessionError {
        warn!(channel_id = channel_id.0, reason = %reason, "live: connection failed");
        self.transition(ConnectionState::Errored);
        SessionError::ConnectionError {
            channel_id: channel_id.0,
            reason,
        }
    }

    /// Opens a connection and joins `channel_id`. A no-op when already joined
    /// to it; any other link is closed first. Gives up with `Cancelled` once
    /// the handshake epoch moves past `epoch`.
    pub async fn join(
        &mut self,
        channel_id: ChannelId,
        sink: Arc<dyn LiveEventSink>,
        epoch: u64,
    ) -> Result<(), SessionError> {
        if self.is_joined_to(channel_id) {
            debug!(channel_id = channel_id.0, "live: already joined");
            return Ok(());
        }
        self.teardown().await;

        self.transition(ConnectionState::Connecting);
        let ws_url = self.ws_url.clone();
        let handshake = async move {
            let (ws_stream, _) = connect_async(ws_url.as_str())
                .await
                .map_err(|err| format!("failed to connect websocket {ws_url}: {err}"))?;
            let (mut writer, reader) = ws_stream.split();
            let join = ClientFrame::JoinChannel { channel_id }
                .encode()
                .map_err(|err| err.to_string())?;
            writer
                .send(WsMessage::Text(join))
                .await
                .map_err(|err| format!("failed to send join: {err}"))?;
            Ok::<_, String>((writer, reader))
        };

        let cancel = Arc::clone(&self.cancel);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.connect_timeout, handshake) => outcome,
            _ = cancel.cancelled(epoch) => {
                debug!(channel_id = channel_id.0, "live: handshake cancelled");
                self.transition(ConnectionState::Closed);
                return Err(SessionError::Cancelled);
            }
        };
        let (writer, reader) = match outcome {
            Ok(Ok(halves)) => halves,
            Ok(Err(reason)) => return Err(self.fail(channel_id, reason)),
            Err(_) => {
                let reason = format!("handshake timed out after {:?}", self.connect_timeout);
                return Err(self.fail(channel_id, reason));
            }
        };

        self.transition(ConnectionState::Joined(channel_id));
        let reader = tokio::spawn(read_frames(
            reader,
            channel_id,
            Arc::clone(&self.state),
            sink,
        ));
        self.link = Some(ActiveLink {
            channel_id,
            writer,
            reader,
        });
        info!(channel_id = channel_id.0, "live: joined channel");
        Ok(())
    }

    /// Writes `frame` if the connection is joined to `channel_id`.
    pub async fn send(
        &mut self,
        channel_id: ChannelId,
        frame: &ClientFrame,
    ) -> Result<(), SessionError> {
        if !self.is_joined_to(channel_id) || frame.channel_id() != channel_id {
            return Err(SessionError::NotConnected);
        }
        let Some(link) = self.link.as_mut() else {
            return Err(SessionError::NotConnected);
        };

        let text = frame.encode()?;
        let written = link.writer.send(WsMessage::Text(text)).await;
        if let Err(err) = written {
            return Err(self.fail(channel_id, format!("failed to send frame: {err}")));
        }
        Ok(())
    }

    /// Releases the current connection, if any. Returns once the reader task
    /// has stopped and the socket is closed.
    pub async fn teardown(&mut self) {
        let Some(mut link) = self.link.take() else {
            if self.state() == ConnectionState::Errored {
                self.transition(ConnectionState::Closing);
                self.transition(ConnectionState::Closed);
            }
            return;
        };

        let channel_id = link.channel_id;
        self.transition(ConnectionState::Closing);

        // The reader stops once the far end acknowledges the close or drops.
        let graceful = tokio::time::timeout(self.close_timeout, async {
            if let Err(err) = link.writer.close().await {
                debug!(channel_id = channel_id.0, error = %err, "live: close frame not sent");
            }
            let _ = (&mut link.reader).await;
        })
        .await;
        if graceful.is_err() {
            debug!(channel_id = channel_id.0, "live: close handshake timed out");
            link.reader.abort();
            let _ = (&mut link.reader).await;
        }
        drop(link);

        self.transition(ConnectionState::Closed);
        info!(channel_id = channel_id.0, "live: connection closed");
    }
}

async fn read_frames(
    mut reader: SplitStream<WsStream>,
    channel_id: ChannelId,
    state: Arc<watch::Sender<ConnectionState>>,
    sink: Arc<dyn LiveEventSink>,
) {
    let reason = loop {
        match reader.next().await {
            Some(Ok(WsMessage::Text(text))) => match route_frame(channel_id, &text) {
                Ok(event) => sink.deliver(event).await,
                Err(SessionError::StaleEventDropped(other)) => {
                    debug!(
                        channel_id = channel_id.0,
                        frame_channel_id = other,
                        "live: dropping event for another channel"
                    );
                }
                Err(err) => {
                    warn!(channel_id = channel_id.0, error = %err, "live: dropping unreadable frame");
                }
            },
            Some(Ok(WsMessage::Close(_))) | None => break "connection closed by server".to_string(),
            Some(Ok(_)) => {}
            Some(Err(err)) => break format!("websocket receive failed: {err}"),
        }
    };

    let lost = state.send_if_modified(|current| {
        if *current == ConnectionState::Joined(channel_id) {
            *current = ConnectionState::Errored;
            true
        } else {
            false
        }
    });
    if !lost {
        debug!(channel_id = channel_id.0, "live: reader stopped");
        return;
    }
    warn!(channel_id = channel_id.0, reason = %reason, "live: connection lost");
    sink.deliver(LiveEvent::Disconnected { reason }).await;
}

/// Parses one inbound frame and checks it belongs to `joined`.
pub(crate) fn route_frame(joined: ChannelId, text: &str) -> Result<LiveEvent, SessionError> {
    let frame = ServerFrame::parse(text)?;
    if let Some(frame_channel) = frame.channel_id() {
        if frame_channel != joined {
            return Err(SessionError::StaleEventDropped(frame_channel.0));
        }
    }
    Ok(match frame {
        ServerFrame::Message(payload) => LiveEvent::Message(payload.into()),
        ServerFrame::Reaction(payload) => LiveEvent::Reaction(payload.into()),
    })
}
