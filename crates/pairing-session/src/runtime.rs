//! Single-task event loop driving a [`SessionCoordinator`].
//!
//! Relay messages, transport callbacks, user intents and the negotiation
//! deadline are all awaited in one `select!`, so the coordinator is only
//! ever touched from one place.

use crate::config::{PairingMode, SessionConfig};
use crate::coordinator::{SessionCoordinator, UserIntent};
use crate::error::{SessionError, SignalingError};
use crate::event::{Dispatch, SessionEvent};
use crate::media::{MediaBridge, TransportEvent, TransportFactory};
use crate::protocol::PeerId;
use crate::signaling::{SignalingChannel, WebSocketChannel};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Cloneable handle for feeding user intents into a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    intents: mpsc::UnboundedSender<UserIntent>,
}

impl SessionHandle {
    /// Returns false once the session loop has exited.
    pub fn submit(&self, intent: UserIntent) -> bool {
        self.intents.send(intent).is_ok()
    }

    pub fn join(&self, username: impl Into<String>) -> bool {
        self.submit(UserIntent::Join {
            username: username.into(),
        })
    }

    pub fn call(&self, peer: impl Into<PeerId>) -> bool {
        self.submit(UserIntent::Call { peer: peer.into() })
    }

    pub fn next(&self) -> bool {
        self.submit(UserIntent::Next)
    }

    pub fn end_call(&self) -> bool {
        self.submit(UserIntent::EndCall)
    }

    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.submit(UserIntent::SendChat { text: text.into() })
    }

    pub fn shutdown(&self) -> bool {
        self.submit(UserIntent::Shutdown)
    }
}

/// Why [`SessionRuntime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    RelayClosed,
}

pub struct SessionRuntime<S> {
    coordinator: SessionCoordinator,
    signaling: S,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    intents: mpsc::UnboundedReceiver<UserIntent>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<S: SignalingChannel> SessionRuntime<S> {
    pub fn new(
        coordinator: SessionCoordinator,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        signaling: S,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runtime = Self {
            coordinator,
            signaling,
            transport_events,
            intents: intents_rx,
            events: events_tx,
        };
        (runtime, SessionHandle { intents: intents_tx }, events_rx)
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Run until shutdown is requested, every handle is dropped or the relay
    /// goes away. Returns the coordinator for inspection.
    pub async fn run(mut self) -> Result<(SessionCoordinator, Exit), SessionError> {
        let started = self.coordinator.start();
        if let Err(err) = self.flush(started).await {
            return self.abort(err).await;
        }

        loop {
            let deadline = self.coordinator.next_deadline();
            let dispatch = tokio::select! {
                message = self.signaling.recv() => match message {
                    Some(message) => self.coordinator.handle_signal(message).await,
                    None => {
                        info!(target: "coordinator", "relay connection lost");
                        let dispatch = self.coordinator.handle_relay_disconnected().await;
                        self.publish(dispatch.events);
                        return Ok((self.coordinator, Exit::RelayClosed));
                    }
                },
                Some(event) = self.transport_events.recv() => {
                    self.coordinator.handle_transport_event(event).await
                }
                intent = self.intents.recv() => match intent {
                    Some(UserIntent::Shutdown) | None => break,
                    Some(intent) => self.coordinator.handle_intent(intent).await,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.coordinator.handle_deadline(Instant::now()).await
                }
            };
            if let Err(err) = self.flush(dispatch).await {
                return self.abort(err).await;
            }
        }

        debug!(target: "coordinator", "shutting down session");
        let dispatch = self.coordinator.shutdown().await;
        if let Err(err) = self.flush(dispatch).await {
            debug!(target: "coordinator", error = %err, "relay gone during shutdown");
        }
        self.signaling.close().await;
        Ok((self.coordinator, Exit::Shutdown))
    }

    /// Deliver relay messages in order, then publish UI events.
    async fn flush(&mut self, dispatch: Dispatch) -> Result<(), SignalingError> {
        let Dispatch { outbound, events } = dispatch;
        for message in outbound {
            self.signaling.send(message).await?;
        }
        self.publish(events);
        Ok(())
    }

    fn publish(&self, events: Vec<SessionEvent>) {
        for event in events {
            // Nobody listening is fine; the session keeps running headless.
            let _ = self.events.send(event);
        }
    }

    async fn abort(
        mut self,
        err: SignalingError,
    ) -> Result<(SessionCoordinator, Exit), SessionError> {
        warn!(target: "coordinator", error = %err, "relay send failed; tearing down");
        let dispatch = self.coordinator.handle_relay_disconnected().await;
        self.publish(dispatch.events);
        Err(err.into())
    }
}

/// Connect to the configured relay over WebSocket and build a runtime ready
/// to [`run`](SessionRuntime::run). In directory mode a configured username
/// is joined automatically.
pub async fn connect(
    config: &SessionConfig,
    factory: Box<dyn TransportFactory>,
    media: Box<dyn MediaBridge>,
) -> Result<
    (
        SessionRuntime<WebSocketChannel>,
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
    ),
    SessionError,
> {
    let signaling = WebSocketChannel::connect(&config.relay_url, config.heartbeat_interval).await?;
    let (coordinator, transport_events) = SessionCoordinator::from_config(config, factory, media);
    let (runtime, handle, events) = SessionRuntime::new(coordinator, transport_events, signaling);
    if config.pairing_mode == PairingMode::Directory {
        if let Some(username) = config.username.as_ref() {
            handle.join(username.clone());
        }
    }
    Ok((runtime, handle, events))
}
