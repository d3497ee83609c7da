use mailrelay_protocol::{ErrorCode, Identity, ServerFrame};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("{kind} frame rejected: connection has not registered")]
    NotRegistered { kind: &'static str },

    #[error("sender {claimed} does not match registered identity {identity}")]
    SenderMismatch { claimed: Identity, identity: Identity },

    #[error("peer {0} is not reachable")]
    PeerUnreachable(Identity),

    #[error("replaced by a newer connection for {0}")]
    Superseded(Identity),
}

impl RelayError {
    /// Protocol error code, or `None` for errors reported as presence.
    pub fn to_error_code(&self) -> Option<ErrorCode> {
        match self {
            RelayError::InvalidFrame(_) | RelayError::SenderMismatch { .. } => {
                Some(ErrorCode::InvalidFrame)
            }
            RelayError::NotRegistered { .. } => Some(ErrorCode::NotRegistered),
            RelayError::Superseded(_) => Some(ErrorCode::Superseded),
            RelayError::PeerUnreachable(_) => None,
        }
    }

    /// The frame the offending connection is told about this error with.
    pub fn to_frame(&self, timestamp: u64) -> ServerFrame {
        match self {
            RelayError::PeerUnreachable(email) => ServerFrame::PeerOffline {
                email: email.clone(),
                timestamp,
            },
            _ => ServerFrame::Error {
                code: self.to_error_code().unwrap_or(ErrorCode::InvalidFrame),
                message: self.to_string(),
                timestamp,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_peer_maps_to_peer_offline() {
        let frame = RelayError::PeerUnreachable("b@x.io".to_string()).to_frame(9);
        assert_eq!(
            frame,
            ServerFrame::PeerOffline {
                email: "b@x.io".to_string(),
                timestamp: 9,
            }
        );
    }

    #[test]
    fn not_registered_carries_code_and_kind() {
        match (RelayError::NotRegistered { kind: "email" }).to_frame(1) {
            ServerFrame::Error { code, message, .. } => {
                assert_eq!(code, ErrorCode::NotRegistered);
                assert!(message.starts_with("email frame rejected"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn error_codes() {
        let spoof = RelayError::SenderMismatch {
            claimed: "c@x.io".to_string(),
            identity: "a@x.io".to_string(),
        };
        assert_eq!(spoof.to_error_code(), Some(ErrorCode::InvalidFrame));
        assert_eq!(
            RelayError::Superseded("a@x.io".to_string()).to_error_code(),
            Some(ErrorCode::Superseded)
        );
        assert_eq!(
            RelayError::PeerUnreachable("b@x.io".to_string()).to_error_code(),
            None
        );
    }
}
