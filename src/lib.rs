//! Selective forwarding unit for real-time Opus audio conferencing
//!
//! Browser clients publish one audio stream into a room and subscribe to the
//! streams of the other participants; the SFU terminates the transport and
//! re-forwards RTP packets without mixing or transcoding.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  HTTP RPC (axum)                                     │
//! │  └─ Router (publish/subscribe/trickle/… signalling)  │
//! │      └─ Engine                                       │
//! │          ├─ RoomRegistry (rid → Room)                │
//! │          │   └─ Room (uid → Peer)                    │
//! │          │       └─ Peer (pc + forwarding loop)      │
//! │          └─ state monitor (60 s snapshot loop)       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Locking goes registry → room → peer and is never inverted; every
//! peer-connection call runs under the timeout harness in [`timeout`].

#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod peer;
pub mod room;
pub mod router;
pub mod rpc;
pub mod timeout;
pub mod turn;

pub use config::Config;
pub use engine::{Engine, State};
pub use error::{Error, Result};
pub use peer::Peer;
pub use room::{Room, RoomRegistry};
pub use router::{PeerInfo, Router};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
