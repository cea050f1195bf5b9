use pairing_session::mock::{MockMedia, MockTransportFactory};
use pairing_session::signaling::LocalChannel;
use pairing_session::{
    Exit, LocalRelay, NegotiationEngine, NegotiationState, Notice, PairingMode, PartnerLostReason,
    PeerId, SessionCoordinator, SessionError, SessionEvent, SessionHandle, SessionRuntime,
    SignalingChannel, SignalingMessage,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(30);

struct Peer {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<Result<(SessionCoordinator, Exit), SessionError>>,
    factory: MockTransportFactory,
    media: MockMedia,
}

impl Peer {
    fn spawn(relay: &LocalRelay, mode: PairingMode) -> Self {
        let factory = MockTransportFactory::new();
        let media = MockMedia::new();
        let (engine, transport_events) =
            NegotiationEngine::new(Box::new(factory.clone()), Box::new(media.clone()), TIMEOUT);
        let coordinator = SessionCoordinator::new(mode, engine, TIMEOUT);
        let (runtime, handle, events) =
            SessionRuntime::new(coordinator, transport_events, relay.connect());
        let task = tokio::spawn(runtime.run());
        Self {
            handle,
            events,
            task,
            factory,
            media,
        }
    }

    async fn wait_for<F>(&mut self, mut predicate: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let event = self.events.recv().await.expect("session loop exited");
            if predicate(&event) {
                return event;
            }
        }
    }

    async fn identity(&mut self) -> PeerId {
        match self
            .wait_for(|event| matches!(event, SessionEvent::LocalIdentity(_)))
            .await
        {
            SessionEvent::LocalIdentity(id) => id,
            _ => unreachable!(),
        }
    }

    async fn connected(&mut self) -> PeerId {
        match self.wait_for(reached(NegotiationState::Connected)).await {
            SessionEvent::StateChanged(transition) => transition.partner,
            _ => unreachable!(),
        }
    }

    async fn stop(self) -> SessionCoordinator {
        self.handle.shutdown();
        let (coordinator, exit) = self.task.await.expect("join").expect("clean exit");
        assert_eq!(exit, Exit::Shutdown);
        coordinator
    }
}

fn reached(state: NegotiationState) -> impl FnMut(&SessionEvent) -> bool {
    move |event| matches!(event, SessionEvent::StateChanged(t) if t.to == state)
}

#[test_timeout::tokio_timeout_test]
async fn strangers_pair_chat_and_rotate() {
    let relay = LocalRelay::new();
    let mut alice = Peer::spawn(&relay, PairingMode::AutoFind);
    let mut bob = Peer::spawn(&relay, PairingMode::AutoFind);
    let alice_id = alice.identity().await;
    let bob_id = bob.identity().await;

    assert_eq!(alice.connected().await, bob_id);
    assert_eq!(bob.connected().await, alice_id);

    alice.handle.send_chat("hello bob");
    let line = bob
        .wait_for(|event| matches!(event, SessionEvent::ChatAppended(_)))
        .await;
    let SessionEvent::ChatAppended(line) = line else {
        unreachable!()
    };
    assert!(!line.sender_is_local);
    assert_eq!(line.text, "hello bob");

    bob.handle.next();
    let lost = alice
        .wait_for(|event| matches!(event, SessionEvent::PartnerLost { .. }))
        .await;
    assert!(matches!(
        lost,
        SessionEvent::PartnerLost { ref partner, reason: PartnerLostReason::PartnerEnded }
            if partner == &bob_id
    ));

    // Only two clients on the relay, so both seekers meet again.
    assert_eq!(alice.connected().await, bob_id);
    assert_eq!(bob.connected().await, alice_id);
    assert_eq!(alice.factory.created(), 2);
    assert_eq!(alice.media.acquisitions(), 1);

    let media = alice.media.clone();
    let coordinator = alice.stop().await;
    assert!(coordinator.chat().is_empty());
    assert_eq!(coordinator.state(), NegotiationState::Idle);
    assert_eq!(media.stops(), 1);

    bob.wait_for(|event| matches!(event, SessionEvent::PartnerLost { .. }))
        .await;
    bob.stop().await;
    assert_eq!(relay.connected(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn busy_callee_turns_third_party_away() {
    let relay = LocalRelay::new();
    let mut alice = Peer::spawn(&relay, PairingMode::Directory);
    let mut bob = Peer::spawn(&relay, PairingMode::Directory);
    let mut carol = Peer::spawn(&relay, PairingMode::Directory);
    for (peer, name) in [(&alice, "alice"), (&bob, "bob"), (&carol, "carol")] {
        peer.handle.join(name);
    }
    for peer in [&mut alice, &mut bob, &mut carol] {
        peer.wait_for(|event| matches!(event, SessionEvent::Presence(users) if users.len() == 3))
            .await;
    }

    alice.handle.call("bob");
    assert_eq!(bob.connected().await, PeerId::from("alice"));
    assert_eq!(alice.connected().await, PeerId::from("bob"));

    carol.handle.call("bob");
    let notice = carol
        .wait_for(|event| matches!(event, SessionEvent::Notice(_)))
        .await;
    assert!(matches!(
        notice,
        SessionEvent::Notice(Notice::PeerBusy { ref peer }) if peer.as_str() == "bob"
    ));
    carol.handle.end_call();

    alice.handle.send_chat("still there?");
    let SessionEvent::ChatAppended(line) = bob
        .wait_for(|event| matches!(event, SessionEvent::ChatAppended(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(line.text, "still there?");
    assert_eq!(bob.factory.created(), 1);

    let bob_coordinator = bob.stop().await;
    assert_eq!(bob_coordinator.local_id(), Some(&PeerId::from("bob")));
    alice.stop().await;
    carol.stop().await;
}

#[test_timeout::tokio_timeout_test]
async fn silent_partner_times_out_and_search_resumes() {
    tokio::time::pause();
    let relay = LocalRelay::new();
    let mut ghost: LocalChannel = relay.connect();
    ghost.send(SignalingMessage::FindPartner).await.unwrap();

    let mut alice = Peer::spawn(&relay, PairingMode::AutoFind);
    let lost = alice
        .wait_for(|event| matches!(event, SessionEvent::PartnerLost { .. }))
        .await;
    assert!(matches!(
        lost,
        SessionEvent::PartnerLost {
            reason: PartnerLostReason::Timeout,
            ..
        }
    ));
    alice
        .wait_for(|event| matches!(event, SessionEvent::Status(_)))
        .await;
    assert_eq!(relay.waiting(), 1);

    let mut seen = Vec::new();
    while let Ok(message) = ghost_next(&mut ghost).await {
        seen.push(message.kind());
    }
    assert_eq!(seen, vec!["welcome", "waiting-offer", "offer", "end-call"]);

    alice.stop().await;
}

async fn ghost_next(ghost: &mut LocalChannel) -> Result<SignalingMessage, ()> {
    tokio::time::timeout(Duration::from_millis(10), ghost.recv())
        .await
        .map_err(|_| ())?
        .ok_or(())
}
