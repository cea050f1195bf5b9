use pairing_session::{
    Notice, PartnerLostReason, SessionEvent, SessionStatus, UserIntent,
};

/// Maps one line typed at the prompt to an intent. Plain text is chat;
/// `/next`, `/end`, `/call <name>`, `/join <name>` and `/quit` are commands.
pub fn parse_line(line: &str) -> Result<Option<UserIntent>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(UserIntent::SendChat {
            text: line.to_string(),
        }));
    };

    let mut parts = command.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());
    let intent = match (verb, arg) {
        ("next", None) => UserIntent::Next,
        ("end" | "hangup", None) => UserIntent::EndCall,
        ("quit" | "exit", None) => UserIntent::Shutdown,
        ("call", Some(peer)) => UserIntent::Call { peer: peer.into() },
        ("join", Some(name)) => UserIntent::Join {
            username: name.to_string(),
        },
        ("call" | "join", None) => return Err(format!("/{verb} needs a name")),
        _ => return Err(format!("unknown command: /{verb}")),
    };
    Ok(Some(intent))
}

/// Text for the event, or `None` when it is not worth printing.
pub fn render(event: &SessionEvent) -> Option<String> {
    let text = match event {
        SessionEvent::Status(status) => format!("* {}", status_line(status)),
        SessionEvent::LocalIdentity(id) => format!("* you are {id}"),
        SessionEvent::ChatAppended(line) if line.sender_is_local => {
            format!("you: {}", line.text)
        }
        SessionEvent::ChatAppended(line) => format!("stranger: {}", line.text),
        SessionEvent::ChatCleared => "* chat cleared".to_string(),
        SessionEvent::Notice(notice) => format!("! {}", notice_line(notice)),
        SessionEvent::PartnerLost { partner, reason } => {
            format!("* {partner} {}", lost_line(*reason))
        }
        SessionEvent::Presence(users) => {
            let names: Vec<&str> = users.keys().map(String::as_str).collect();
            format!("* online: {}", names.join(", "))
        }
        SessionEvent::RemoteStream(Some(stream)) => {
            format!("* receiving {:?} from stream {}", stream.kind, stream.id)
        }
        SessionEvent::StateChanged(_) | SessionEvent::RemoteStream(None) => return None,
    };
    Some(text)
}

fn status_line(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Connecting => "connecting to relay".to_string(),
        SessionStatus::Searching => "looking for a partner".to_string(),
        SessionStatus::Available => "available".to_string(),
        SessionStatus::Paired { partner } => format!("paired with {partner}"),
        SessionStatus::InCall { partner } => format!("in call with {partner}"),
        SessionStatus::Disconnected => "disconnected".to_string(),
    }
}

fn notice_line(notice: &Notice) -> String {
    match notice {
        Notice::PeerBusy { peer } => format!("{peer} is busy"),
        Notice::AlreadyInCall { partner } => format!("already in a call with {partner}"),
        Notice::RejectedIncoming { from } => format!("turned away a call from {from}"),
        Notice::MediaUnavailable { reason } => format!("camera/microphone unavailable: {reason}"),
    }
}

fn lost_line(reason: PartnerLostReason) -> &'static str {
    match reason {
        PartnerLostReason::PartnerLeft => "left",
        PartnerLostReason::PartnerEnded => "ended the call",
        PartnerLostReason::TransportFailure => "dropped (connection failed)",
        PartnerLostReason::Timeout => "did not answer in time",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairing_session::{ChatLine, PeerId};

    #[test_timeout::timeout]
    fn commands_and_chat_parse() {
        assert!(matches!(parse_line("/next"), Ok(Some(UserIntent::Next))));
        assert!(matches!(parse_line("  /end "), Ok(Some(UserIntent::EndCall))));
        assert!(matches!(parse_line("/quit"), Ok(Some(UserIntent::Shutdown))));
        assert!(matches!(
            parse_line("/call  bob"),
            Ok(Some(UserIntent::Call { peer })) if peer == PeerId::from("bob")
        ));
        assert!(matches!(
            parse_line("hello there"),
            Ok(Some(UserIntent::SendChat { text })) if text == "hello there"
        ));
        assert!(matches!(parse_line("   "), Ok(None)));
    }

    #[test_timeout::timeout]
    fn bad_commands_are_reported() {
        assert_eq!(parse_line("/call").unwrap_err(), "/call needs a name");
        assert_eq!(parse_line("/dance").unwrap_err(), "unknown command: /dance");
    }

    #[test_timeout::timeout]
    fn chat_lines_are_attributed() {
        let local = SessionEvent::ChatAppended(ChatLine {
            sender_is_local: true,
            text: "hi".into(),
        });
        let remote = SessionEvent::ChatAppended(ChatLine {
            sender_is_local: false,
            text: "hello".into(),
        });
        assert_eq!(render(&local).as_deref(), Some("you: hi"));
        assert_eq!(render(&remote).as_deref(), Some("stranger: hello"));
        assert_eq!(render(&SessionEvent::RemoteStream(None)), None);
    }

    #[test_timeout::timeout]
    fn partner_loss_names_the_peer() {
        let event = SessionEvent::PartnerLost {
            partner: PeerId::from("bob"),
            reason: PartnerLostReason::Timeout,
        };
        assert_eq!(
            render(&event).as_deref(),
            Some("* bob did not answer in time")
        );
    }
}
