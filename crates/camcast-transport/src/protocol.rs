//! Control datagram protocol.

/// Control datagrams are read into a buffer of this size; longer payloads
/// are truncated.
pub const MAX_CONTROL_DATAGRAM: usize = 32;

const LOGIN: &[u8] = b"login";
const PING: &[u8] = b"ping";

/// A recognized client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Subscribe, or keep an existing subscription.
    Login,

    /// Keep-alive for an existing subscription.
    Ping,
}

impl ControlMessage {
    /// Classify a payload by the keyword it contains. `login` wins when both
    /// appear.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if contains(payload, LOGIN) {
            Some(Self::Login)
        } else if contains(payload, PING) {
            Some(Self::Ping)
        } else {
            None
        }
    }

    /// Wire form.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Login => LOGIN,
            Self::Ping => PING,
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords() {
        assert_eq!(ControlMessage::parse(b"login"), Some(ControlMessage::Login));
        assert_eq!(ControlMessage::parse(b"ping"), Some(ControlMessage::Ping));
        assert_eq!(ControlMessage::parse(b"hello"), None);
        assert_eq!(ControlMessage::parse(b""), None);
    }

    #[test]
    fn test_keyword_anywhere_in_payload() {
        assert_eq!(
            ControlMessage::parse(b"client-7 login\n"),
            Some(ControlMessage::Login)
        );
        assert_eq!(ControlMessage::parse(b"\x00ping\x00"), Some(ControlMessage::Ping));
    }

    #[test]
    fn test_login_takes_precedence() {
        assert_eq!(
            ControlMessage::parse(b"ping login"),
            Some(ControlMessage::Login)
        );
    }

    #[test]
    fn test_wire_form_parses_back() {
        for message in [ControlMessage::Login, ControlMessage::Ping] {
            assert_eq!(ControlMessage::parse(message.as_bytes()), Some(message));
        }
    }
}
