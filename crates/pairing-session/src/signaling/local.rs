use super::SignalingChannel;
use crate::error::SignalingError;
use crate::protocol::{PeerId, PresenceMeta, SignalingMessage, generate_peer_id};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

type Outbox = mpsc::UnboundedSender<SignalingMessage>;

#[derive(Default)]
struct RelayState {
    next_conn: u64,
    /// Connection -> id it is currently known by.
    ids: HashMap<u64, PeerId>,
    outboxes: HashMap<PeerId, Outbox>,
    joined: HashSet<PeerId>,
    /// Peer -> partner, once an answer has been relayed.
    in_call: HashMap<PeerId, PeerId>,
    waiting: VecDeque<PeerId>,
}

impl RelayState {
    fn deliver(&self, to: &PeerId, message: SignalingMessage) -> bool {
        match self.outboxes.get(to) {
            Some(outbox) => outbox.send(message).is_ok(),
            None => {
                debug!(target: "signaling", to = %to, kind = message.kind(), "no such peer; dropped");
                false
            }
        }
    }

    fn broadcast_presence(&self) {
        let users: BTreeMap<String, PresenceMeta> = self
            .joined
            .iter()
            .map(|id| {
                let meta = PresenceMeta {
                    in_call: self.in_call.contains_key(id),
                    joined_at: None,
                };
                (id.to_string(), meta)
            })
            .collect();
        for id in &self.joined {
            self.deliver(
                id,
                SignalingMessage::PresenceList {
                    users: users.clone(),
                },
            );
        }
    }

    fn find_partner(&mut self, seeker: PeerId) {
        self.waiting.retain(|id| id != &seeker);
        while let Some(waiting) = self.waiting.pop_front() {
            if !self.outboxes.contains_key(&waiting) {
                continue;
            }
            debug!(target: "signaling", offerer = %seeker, answerer = %waiting, "paired");
            self.deliver(
                &waiting,
                SignalingMessage::WaitingOffer {
                    from: seeker.clone(),
                },
            );
            self.deliver(&seeker, SignalingMessage::PairAssigned { to: waiting });
            return;
        }
        self.waiting.push_back(seeker);
    }

    fn rename(&mut self, conn: u64, username: String) -> Option<PeerId> {
        let previous = self.ids.get(&conn)?.clone();
        let renamed = PeerId::new(username);
        if let Some(outbox) = self.outboxes.remove(&previous) {
            self.outboxes.insert(renamed.clone(), outbox);
        }
        self.waiting.retain(|id| id != &previous);
        self.joined.remove(&previous);
        self.joined.insert(renamed.clone());
        self.ids.insert(conn, renamed.clone());
        Some(renamed)
    }

    fn hang_up(&mut self, a: &PeerId, b: &PeerId) -> bool {
        if self.in_call.get(a) != Some(b) {
            return false;
        }
        self.in_call.remove(a);
        self.in_call.remove(b);
        true
    }
}

/// In-process relay implementing the same pairing and forwarding rules as
/// the network relay.
#[derive(Clone, Default)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection. The relay greets it with a `welcome` carrying a
    /// fresh id.
    pub fn connect(&self) -> LocalChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = generate_peer_id();
        let mut state = self.state.lock();
        state.next_conn += 1;
        let conn = state.next_conn;
        state.ids.insert(conn, id.clone());
        let _ = tx.send(SignalingMessage::Welcome { id: id.clone() });
        state.outboxes.insert(id, tx);
        LocalChannel {
            conn,
            relay: self.clone(),
            rx,
        }
    }

    pub fn connected(&self) -> usize {
        self.state.lock().ids.len()
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }

    fn route(&self, conn: u64, message: SignalingMessage) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        let sender = state
            .ids
            .get(&conn)
            .cloned()
            .ok_or(SignalingError::ChannelClosed)?;
        match message {
            SignalingMessage::Join { username } => {
                if state.rename(conn, username).is_some() {
                    state.broadcast_presence();
                }
            }
            SignalingMessage::FindPartner => state.find_partner(sender),
            message => {
                let Some(target) = message.target().cloned() else {
                    debug!(target: "signaling", kind = message.kind(), "not forwardable; dropped");
                    return Ok(());
                };
                let presence_changed = match &message {
                    SignalingMessage::Answer { .. } => {
                        state.in_call.insert(sender.clone(), target.clone());
                        state.in_call.insert(target.clone(), sender.clone());
                        true
                    }
                    SignalingMessage::EndCall { .. } | SignalingMessage::Next { .. } => {
                        state.hang_up(&sender, &target)
                    }
                    _ => false,
                };
                state.deliver(&target, message.stamped(&sender));
                if presence_changed && !state.joined.is_empty() {
                    state.broadcast_presence();
                }
            }
        }
        Ok(())
    }

    fn disconnect(&self, conn: u64) {
        let mut state = self.state.lock();
        let Some(id) = state.ids.remove(&conn) else {
            return;
        };
        state.outboxes.remove(&id);
        state.waiting.retain(|waiting| waiting != &id);
        if let Some(partner) = state.in_call.remove(&id) {
            state.in_call.remove(&partner);
        }
        let was_joined = state.joined.remove(&id);
        for other in state.outboxes.keys() {
            state.deliver(other, SignalingMessage::PartnerLeft { user: id.clone() });
        }
        if was_joined {
            state.broadcast_presence();
        }
        debug!(target: "signaling", id = %id, "client left");
    }
}

pub struct LocalChannel {
    conn: u64,
    relay: LocalRelay,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

#[async_trait]
impl SignalingChannel for LocalChannel {
    async fn send(&mut self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.relay.route(self.conn, message)
    }

    async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.relay.disconnect(self.conn);
        self.rx.close();
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.relay.disconnect(self.conn);
    }
}
