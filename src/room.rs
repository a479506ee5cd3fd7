//! Rooms and the room registry
//!
//! A Room is an ordered-by-insertion mapping from participant uid to Peer,
//! guarded by a read-write lock. Mutations go through a write guard
//! ([`RoomGuard`]) so the replace path can hand the displaced Peer back to
//! the caller, to be closed only after the Room lock is released — the lock
//! order is registry, then room, then peer, never inverted.

use crate::error::{Error, Result};
use crate::peer::{Peer, TRACK_CLOSED_ID};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockWriteGuard};

/// A conversation room
pub struct Room {
    id: String,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the uid → Peer mapping, taken under read access so iteration
    /// never holds the Room lock across peer-connection calls.
    pub async fn peers_snapshot(&self) -> HashMap<String, Arc<Peer>> {
        self.peers.read().await.clone()
    }

    /// Look up a Peer by uid, checking the caller-quoted cid against the
    /// current incarnation.
    pub async fn get_peer(&self, uid: &str, cid: &str) -> Result<Arc<Peer>> {
        let peers = self.peers.read().await;
        lookup(&self.id, &peers, uid, cid).await
    }

    /// Take exclusive access for publish/subscribe serialisation.
    pub async fn lock(&self) -> RoomGuard<'_> {
        RoomGuard {
            room_id: &self.id,
            peers: self.peers.write().await,
        }
    }
}

/// Write-token over a Room's peers. Holding it serialises publish and
/// subscribe within the room; the replace path returns the displaced Peer so
/// the caller closes it after dropping the guard.
pub struct RoomGuard<'a> {
    room_id: &'a str,
    peers: RwLockWriteGuard<'a, HashMap<String, Arc<Peer>>>,
}

impl RoomGuard<'_> {
    pub async fn get_peer(&self, uid: &str, cid: &str) -> Result<Arc<Peer>> {
        lookup(self.room_id, &self.peers, uid, cid).await
    }

    pub fn peers_snapshot(&self) -> HashMap<String, Arc<Peer>> {
        self.peers.clone()
    }

    /// Install a Peer at its uid, returning the displaced entry if any.
    /// Closing the displaced Peer is the caller's job, outside this guard.
    #[must_use]
    pub fn insert_replacing(&mut self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.peers.insert(peer.uid().to_string(), peer)
    }
}

async fn lookup(
    room_id: &str,
    peers: &HashMap<String, Arc<Peer>>,
    uid: &str,
    cid: &str,
) -> Result<Arc<Peer>> {
    let peer = peers.get(uid).ok_or_else(|| Error::PeerNotFound {
        rid: room_id.to_string(),
        uid: uid.to_string(),
    })?;
    let current = peer.cid().await;
    if current == TRACK_CLOSED_ID {
        return Err(Error::PeerClosed {
            rid: room_id.to_string(),
            uid: uid.to_string(),
        });
    }
    if current != cid {
        return Err(Error::TrackNotFound {
            rid: room_id.to_string(),
            uid: uid.to_string(),
            cid: cid.to_string(),
        });
    }
    Ok(Arc::clone(peer))
}

/// rid → Room. Entries are created on first reference and kept for the
/// process lifetime.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two-step get-or-create: a shared-access hit avoids the write lock;
    /// the write path re-checks because another task may have won the race.
    pub async fn get_or_create(&self, rid: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().await.get(rid) {
            return Arc::clone(room);
        }

        let mut rooms = self.rooms.write().await;
        Arc::clone(
            rooms
                .entry(rid.to_string())
                .or_insert_with(|| Arc::new(Room::new(rid.to_string()))),
        )
    }

    /// Copy of all rooms, for the state monitor.
    pub async fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }
}
