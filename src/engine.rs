//! Engine state and the periodic state monitor
//!
//! The engine owns the room registry and the network identity handed to
//! every peer connection (public IP, interface, UDP port range). A monitor
//! task walks the registry once a minute, counts peers and rooms by
//! liveness, tracks running peaks, and atomically replaces the published
//! snapshot served by the `info` RPC.

use crate::config::EngineConfig;
use crate::peer::TRACK_CLOSED_ID;
use crate::room::RoomRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

const STATE_LOOP_PERIOD: Duration = Duration::from_secs(60);

/// Point-in-time aggregate of peers and rooms, with running peaks
#[derive(Debug, Clone, Serialize)]
pub struct State {
    pub booted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active_peers: usize,
    pub closed_peers: usize,
    pub peak_peers: usize,
    pub active_rooms: usize,
    pub closed_rooms: usize,
    pub peak_rooms: usize,
}

impl State {
    fn new(booted_at: DateTime<Utc>) -> Self {
        Self {
            booted_at,
            updated_at: booted_at,
            active_peers: 0,
            closed_peers: 0,
            peak_peers: 0,
            active_rooms: 0,
            closed_rooms: 0,
            peak_rooms: 0,
        }
    }
}

/// Shared engine: network identity, room registry, state snapshot
pub struct Engine {
    pub ip: String,
    pub interface: String,
    pub port_min: u16,
    pub port_max: u16,

    rooms: RoomRegistry,
    state: RwLock<State>,
    booted_at: DateTime<Utc>,
}

impl Engine {
    pub fn new(conf: &EngineConfig) -> Arc<Self> {
        let booted_at = Utc::now();
        info!(
            ip = %conf.address,
            interface = %conf.interface,
            port_min = conf.port_min,
            port_max = conf.port_max,
            "engine built"
        );
        Arc::new(Self {
            ip: conf.address.clone(),
            interface: conf.interface.clone(),
            port_min: conf.port_min,
            port_max: conf.port_max,
            rooms: RoomRegistry::new(),
            state: RwLock::new(State::new(booted_at)),
            booted_at,
        })
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// The last snapshot produced by the monitor loop
    pub async fn state(&self) -> State {
        self.state.read().await.clone()
    }

    /// Periodic aggregation loop; never returns.
    pub async fn run_monitor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STATE_LOOP_PERIOD);
        loop {
            ticker.tick().await;
            self.update_state().await;
        }
    }

    async fn update_state(&self) {
        let mut next = State::new(self.booted_at);
        next.updated_at = Utc::now();

        for room in self.rooms.snapshot().await {
            let peers = room.peers_snapshot().await;
            let mut active = 0;
            let mut closed = 0;
            for peer in peers.values() {
                if peer.cid().await == TRACK_CLOSED_ID {
                    closed += 1;
                } else {
                    active += 1;
                }
            }
            next.active_peers += active;
            next.closed_peers += closed;
            if active > 0 {
                next.active_rooms += 1;
                info!(
                    room = %room.id(),
                    active_peers = active,
                    closed_peers = closed,
                    "room activity"
                );
            } else {
                next.closed_rooms += 1;
            }
        }

        let mut state = self.state.write().await;
        next.peak_peers = state.peak_peers.max(next.active_peers);
        next.peak_rooms = state.peak_rooms.max(next.active_rooms);
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn test_initial_state_is_empty() {
        let engine = Engine::new(&EngineConfig::default());
        let state = engine.state().await;
        assert_eq!(state.active_peers, 0);
        assert_eq!(state.peak_peers, 0);
        assert_eq!(state.booted_at, state.updated_at);
    }

    #[tokio::test]
    async fn test_update_state_counts_empty_rooms_as_closed() {
        let engine = Engine::new(&EngineConfig::default());
        engine.rooms().get_or_create("room-1").await;
        engine.update_state().await;

        let state = engine.state().await;
        assert_eq!(state.active_rooms, 0);
        assert_eq!(state.closed_rooms, 1);
        assert_eq!(state.peak_rooms, 0);
    }

    #[tokio::test]
    async fn test_peaks_are_monotonic() {
        let engine = Engine::new(&EngineConfig::default());
        {
            let mut state = engine.state.write().await;
            state.peak_peers = 7;
            state.peak_rooms = 3;
        }
        engine.update_state().await;

        let state = engine.state().await;
        assert_eq!(state.peak_peers, 7);
        assert_eq!(state.peak_rooms, 3);
    }
}
