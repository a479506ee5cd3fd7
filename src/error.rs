//! Error types for the SFU
//!
//! Every error that can reach a client carries a stable numeric code; the RPC
//! layer serialises errors as `{code, description}` in the `error` field.

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Result type alias using the SFU Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by signalling operations and the RPC boundary
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Arity, type, or syntactic validation failure at the RPC boundary
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Malformed jsep/SDP or wrong type (offer/answer mismatch)
    #[error("invalid sdp: {0}")]
    InvalidSdp(String),

    /// Malformed ICE candidate JSON
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    /// No entry for the uid in the room
    #[error("peer {uid} not found in {rid}")]
    PeerNotFound { rid: String, uid: String },

    /// The entry for the uid has been terminated
    #[error("peer {uid} closed in {rid}")]
    PeerClosed { rid: String, uid: String },

    /// The entry's cid does not match the supplied cid
    #[error("peer {uid} track not match {cid} in {rid}")]
    TrackNotFound {
        rid: String,
        uid: String,
        cid: String,
    },

    /// publish exceeded the caller-supplied limit
    #[error("room full {0}")]
    RoomFull(String),

    /// Peer-connection library failure outside the negotiation steps below
    #[error("webrtc: {0}")]
    WebRtc(String),

    /// Failed to construct a peer connection
    #[error("new peer connection: {0}")]
    ServerNewPeerConnection(String),

    /// Failed to apply the remote offer
    #[error("set remote offer: {0}")]
    ServerSetRemoteOffer(String),

    /// Failed to apply the remote answer
    #[error("set remote answer: {0}")]
    ServerSetRemoteAnswer(String),

    /// Failed to create a local offer
    #[error("create offer: {0}")]
    ServerCreateOffer(String),

    /// Failed to set the local offer
    #[error("set local offer: {0}")]
    ServerSetLocalOffer(String),

    /// Failed to create a local answer
    #[error("create answer: {0}")]
    ServerCreateAnswer(String),

    /// Failed to set the local answer
    #[error("set local answer: {0}")]
    ServerSetLocalAnswer(String),

    /// The timeout harness fired before the operation completed
    #[error("timeout after {0:?}")]
    ServerTimeout(Duration),
}

impl Error {
    /// Stable numeric code shipped to clients
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidParams(_) => 4001,
            Error::InvalidSdp(_) => 4002,
            Error::InvalidCandidate(_) => 4003,
            Error::PeerNotFound { .. } => 4041,
            Error::PeerClosed { .. } => 4042,
            Error::TrackNotFound { .. } => 4043,
            Error::RoomFull(_) => 4290,
            Error::WebRtc(_) => 5000,
            Error::ServerNewPeerConnection(_) => 5001,
            Error::ServerSetRemoteOffer(_) => 5002,
            Error::ServerSetRemoteAnswer(_) => 5003,
            Error::ServerCreateOffer(_) => 5004,
            Error::ServerSetLocalOffer(_) => 5005,
            Error::ServerCreateAnswer(_) => 5006,
            Error::ServerSetLocalAnswer(_) => 5007,
            Error::ServerTimeout(_) => 5008,
        }
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Error", 2)?;
        state.serialize_field("code", &self.code())?;
        state.serialize_field("description", &self.to_string())?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::InvalidParams("x".to_string()).code(), 4001);
        assert_eq!(
            Error::PeerNotFound {
                rid: "r".to_string(),
                uid: "u".to_string()
            }
            .code(),
            4041
        );
        assert_eq!(Error::RoomFull("2".to_string()).code(), 4290);
        assert_eq!(
            Error::ServerTimeout(Duration::from_secs(5)).code(),
            5008
        );
    }

    #[test]
    fn test_error_serializes_code_and_description() {
        let err = Error::PeerClosed {
            rid: "room-1".to_string(),
            uid: "alice".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], 4042);
        assert_eq!(json["description"], "peer alice closed in room-1");
    }

    #[test]
    fn test_track_not_found_display() {
        let err = Error::TrackNotFound {
            rid: "r".to_string(),
            uid: "u".to_string(),
            cid: "c".to_string(),
        };
        assert_eq!(err.to_string(), "peer u track not match c in r");
    }
}
