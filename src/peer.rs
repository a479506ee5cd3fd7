//! Peer lifecycle and media forwarding
//!
//! A Peer owns one peer connection, the inbound Opus track it publishes, the
//! local track subscribers attach to, and the forwarding loop between the
//! two. All mutable state sits behind a single RwLock (the "Peer lock");
//! rooms hold their own lock and the order is always room before peer.

use crate::error::{Error, Result};
use crate::timeout::{self, CONNECT, READ};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Sentinel cid of a terminated Peer; not a UUID so it can never collide
/// with a live track id.
pub const TRACK_CLOSED_ID: &str = "CLOSED";

/// Bounded forwarding queue depth
const QUEUE_CAPACITY: usize = 8;

/// Opus payload types offered by the browsers we accept audio from
const OPUS_PAYLOAD_CHROME: u8 = 111;
const OPUS_PAYLOAD_FIREFOX: u8 = 109;

static CALLBACK_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn callback_client() -> &'static reqwest::Client {
    CALLBACK_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client")
    })
}

/// A subscriber-side sender handle, remembered with the publisher cid it was
/// attached under so renegotiation can detect stale attachments.
#[derive(Clone, Debug)]
pub struct SenderHandle {
    pub id: String,
    pub rtp: Arc<RTCRtpSender>,
}

/// Mutable Peer attributes, guarded by the Peer lock
#[derive(Debug)]
pub(crate) struct PeerState {
    pub cid: String,
    pub listen_only: bool,
    pub track: Option<Arc<TrackLocalStaticRTP>>,
    pub publishers: HashMap<String, SenderHandle>,
}

/// One participant's media session inside a room
#[derive(Debug)]
pub struct Peer {
    rid: String,
    uid: String,
    callback: Option<String>,
    pc: Arc<RTCPeerConnection>,
    state: RwLock<PeerState>,
    connected: Mutex<Option<oneshot::Sender<()>>>,
}

impl Peer {
    /// Build a Peer around a freshly negotiated peer connection, install its
    /// event handlers, and arm the connect watchdog.
    pub fn build(
        rid: String,
        uid: String,
        pc: Arc<RTCPeerConnection>,
        callback: Option<String>,
        listen_only: bool,
    ) -> Arc<Self> {
        let cid = Uuid::new_v4().to_string();
        let (connected_tx, connected_rx) = oneshot::channel();

        let peer = Arc::new(Self {
            rid,
            uid,
            callback,
            pc,
            state: RwLock::new(PeerState {
                cid,
                listen_only,
                track: None,
                publishers: HashMap::new(),
            }),
            connected: Mutex::new(Some(connected_tx)),
        });
        peer.install_handlers(connected_rx);
        peer
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Current incarnation id (the CLOSED sentinel after termination)
    pub async fn cid(&self) -> String {
        self.state.read().await.cid.clone()
    }

    pub fn pc(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// (cid, listen_only) under a single read of the Peer lock
    pub async fn snapshot(&self) -> (String, bool) {
        let state = self.state.read().await;
        (state.cid.clone(), state.listen_only)
    }

    /// Flip the provisional-mute flag, returning the new (cid, listen_only)
    pub async fn toggle_listen_only(&self) -> (String, bool) {
        let mut state = self.state.write().await;
        state.listen_only = !state.listen_only;
        (state.cid.clone(), state.listen_only)
    }

    fn install_handlers(self: &Arc<Self>, connected_rx: oneshot::Receiver<()>) {
        // Connect watchdog: a Peer that never delivers an inbound track is
        // torn down after the negotiation deadline.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = connected_rx => {}
                _ = tokio::time::sleep(CONNECT) => {
                    if let Some(peer) = weak.upgrade() {
                        warn!(rid = %peer.rid, uid = %peer.uid, "no inbound track before deadline");
                        let _ = peer.close().await;
                    }
                }
            }
        });

        let rid = self.rid.clone();
        let uid = self.uid.clone();
        self.pc.on_signaling_state_change(Box::new(move |s| {
            debug!(rid = %rid, uid = %uid, state = %s, "signaling state changed");
            Box::pin(async {})
        }));

        let rid = self.rid.clone();
        let uid = self.uid.clone();
        self.pc.on_peer_connection_state_change(Box::new(move |s| {
            debug!(rid = %rid, uid = %uid, state = %s, "connection state changed");
            Box::pin(async {})
        }));

        let rid = self.rid.clone();
        let uid = self.uid.clone();
        self.pc.on_ice_connection_state_change(Box::new(move |s| {
            debug!(rid = %rid, uid = %uid, state = %s, "ice connection state changed");
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(peer) = weak.upgrade() {
                        tokio::spawn(peer.handle_remote_track(track));
                    }
                })
            }));
    }

    /// Driven by the on-track event: accept the first recognised Opus track,
    /// notify the callback URL if configured, then forward packets until the
    /// stream ends. The Peer is closed when this returns.
    async fn handle_remote_track(self: Arc<Self>, rt: Arc<TrackRemote>) {
        info!(
            rid = %self.rid,
            uid = %self.uid,
            track = %rt.id(),
            payload_type = rt.payload_type(),
            ssrc = rt.ssrc(),
            "remote track received"
        );

        if !self.accept_remote_track(&rt).await {
            return;
        }
        self.mark_connected().await;

        match self.callback_on_track().await {
            Err(err) => {
                warn!(rid = %self.rid, uid = %self.uid, %err, "ontrack callback failed");
            }
            Ok(()) => {
                let result = self.forward(rt).await;
                debug!(rid = %self.rid, uid = %self.uid, ?result, "forwarding ended");
            }
        }

        let result = self.close().await;
        debug!(rid = %self.rid, uid = %self.uid, ?result, "peer torn down after track end");
    }

    /// Under the Peer lock: accept an inbound track if the Peer is open, no
    /// track was accepted before, and the payload type is a recognised Opus
    /// mapping. Builds the local outbound track named by the cid.
    async fn accept_remote_track(&self, rt: &TrackRemote) -> bool {
        let mut state = self.state.write().await;
        if state.cid == TRACK_CLOSED_ID {
            return false;
        }
        let payload_type = rt.payload_type();
        if state.track.is_some()
            || (payload_type != OPUS_PAYLOAD_CHROME && payload_type != OPUS_PAYLOAD_FIREFOX)
        {
            return false;
        }
        let local = TrackLocalStaticRTP::new(
            rt.codec().capability,
            state.cid.clone(),
            self.uid.clone(),
        );
        state.track = Some(Arc::new(local));
        true
    }

    /// Deliver the one-shot connected signal, releasing the watchdog.
    async fn mark_connected(&self) {
        if let Some(tx) = self.connected.lock().await.take() {
            let _ = tx.send(());
        }
    }

    /// POST `{rid, uid, cid, action: "ontrack"}` to the configured callback
    /// URL. A non-200 response fails the Peer.
    async fn callback_on_track(&self) -> anyhow::Result<()> {
        let Some(url) = &self.callback else {
            return Ok(());
        };
        let cid = self.cid().await;
        let body = serde_json::json!({
            "rid": self.rid,
            "uid": self.uid,
            "cid": cid,
            "action": "ontrack",
        });
        let response = callback_client().post(url).json(&body).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            anyhow::bail!("callback status: {}", response.status());
        }
        Ok(())
    }

    /// Forwarding loop. The producer reads RTP from the remote track into a
    /// bounded queue and closes it on EOF or error; the consumer drains the
    /// queue into the local track under the read watchdog.
    async fn forward(&self, rt: Arc<TrackRemote>) -> Result<()> {
        let (queue_tx, mut queue_rx) = mpsc::channel::<Packet>(QUEUE_CAPACITY);

        let rid = self.rid.clone();
        let uid = self.uid.clone();
        tokio::spawn(async move {
            loop {
                match rt.read_rtp().await {
                    Ok((packet, _)) => {
                        if queue_tx.send(packet).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        debug!(rid = %rid, uid = %uid, %err, "remote track read ended");
                        return;
                    }
                }
            }
        });

        loop {
            self.consume_queue(&mut queue_rx).await?;
        }
    }

    async fn consume_queue(&self, queue_rx: &mut mpsc::Receiver<Packet>) -> Result<()> {
        match tokio::time::timeout(READ, queue_rx.recv()).await {
            Err(_) => Err(Error::ServerTimeout(READ)),
            Ok(None) => Err(Error::WebRtc(format!("peer {} queue closed", self.uid))),
            Ok(Some(mut packet)) => {
                let (track, listen_only) = {
                    let state = self.state.read().await;
                    match &state.track {
                        Some(track) => (Arc::clone(track), state.listen_only),
                        None => {
                            return Err(Error::PeerClosed {
                                rid: self.rid.clone(),
                                uid: self.uid.clone(),
                            })
                        }
                    }
                };
                if listen_only {
                    // TODO replace the zeroed payload with real Opus DTX
                    // comfort-noise frames
                    packet.payload = Bytes::from(vec![0u8; packet.payload.len()]);
                }
                track
                    .write_rtp(&packet)
                    .await
                    .map(|_| ())
                    .map_err(|e| Error::WebRtc(format!("peer {} track write: {e}", self.uid)))
            }
        }
    }

    /// Idempotent close: retire the cid, drop the local track, close the
    /// peer connection. Runs under the Peer lock with the read deadline.
    pub async fn close(&self) -> Result<()> {
        info!(rid = %self.rid, uid = %self.uid, "peer close");
        let mut state = self.state.write().await;
        let result = timeout::run_with_timeout(READ, Self::close_locked(&self.pc, &mut state)).await;
        info!(rid = %self.rid, uid = %self.uid, ?result, "peer close done");
        result
    }

    async fn close_locked(pc: &Arc<RTCPeerConnection>, state: &mut PeerState) -> Result<()> {
        if state.cid == TRACK_CLOSED_ID {
            return Ok(());
        }
        state.track = None;
        state.cid = TRACK_CLOSED_ID.to_string();
        pc.close()
            .await
            .map_err(|e| Error::WebRtc(format!("close: {e}")))
    }

    /// Apply a renegotiation offer under the Peer lock, answer it, and wait
    /// for gathering. Any failure tears the Peer down.
    pub async fn restart(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        let mut state = self.state.write().await;
        let result = timeout::run_with_timeout(CONNECT, async {
            self.pc
                .set_remote_description(offer)
                .await
                .map_err(|e| Error::ServerSetRemoteOffer(e.to_string()))?;
            let answer = self
                .pc
                .create_answer(None)
                .await
                .map_err(|e| Error::ServerCreateAnswer(e.to_string()))?;
            set_local_description(&self.pc, answer)
                .await
                .map_err(|e| Error::ServerSetLocalAnswer(e.to_string()))?;
            Ok(())
        })
        .await;

        if let Err(err) = result {
            let _ = timeout::run_with_timeout(READ, Self::close_locked(&self.pc, &mut state)).await;
            return Err(err);
        }
        self.pc
            .local_description()
            .await
            .ok_or_else(|| Error::WebRtc("local description unavailable".to_string()))
    }

    /// Set the subscriber's remote answer under the Peer lock.
    pub async fn apply_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        let _guard = self.state.write().await;
        timeout::run_with_timeout(READ, async {
            self.pc
                .set_remote_description(answer)
                .await
                .map_err(|e| Error::ServerSetRemoteAnswer(e.to_string()))
        })
        .await
    }

    /// Add a trickled remote ICE candidate under the Peer lock.
    pub async fn add_candidate(
        &self,
        candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit,
    ) -> Result<()> {
        let _guard = self.state.write().await;
        timeout::run_with_timeout(READ, async {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| Error::WebRtc(format!("add candidate: {e}")))
        })
        .await
    }

    /// Reconcile this subscriber against every publisher in the room
    /// snapshot, then renegotiate locally if the sender set changed. The
    /// subscriber's Peer lock is held throughout; publisher locks are taken
    /// read-shared one at a time (subscriber before publisher, always).
    pub async fn do_subscribe(&self, peers: &HashMap<String, Arc<Peer>>) -> Result<()> {
        let mut state = self.state.write().await;
        timeout::run_with_timeout(READ, async {
            let mut renegotiate = false;
            for publisher in peers.values() {
                if publisher.uid == self.uid {
                    continue;
                }
                let changed = self.connect_publisher(&mut state, publisher).await?;
                renegotiate = renegotiate || changed;
            }
            if renegotiate {
                let offer = self
                    .pc
                    .create_offer(None)
                    .await
                    .map_err(|e| Error::ServerCreateOffer(e.to_string()))?;
                set_local_description(&self.pc, offer)
                    .await
                    .map_err(|e| Error::ServerSetLocalOffer(e.to_string()))?;
            }
            Ok(())
        })
        .await
    }

    /// Attach or refresh one publisher's track on this subscriber. Returns
    /// whether the sender set changed. A stale sender (publisher replaced or
    /// track gone) is removed before the current track is attached.
    async fn connect_publisher(
        &self,
        sub_state: &mut PeerState,
        publisher: &Arc<Peer>,
    ) -> Result<bool> {
        let pub_state = publisher.state.read().await;
        timeout::run_with_timeout(READ, async {
            let mut renegotiate = false;
            let old = sub_state.publishers.get(publisher.uid()).cloned();

            if let Some(old) = &old {
                if pub_state.track.is_none() || old.id != pub_state.cid {
                    self.pc.remove_track(&old.rtp).await.map_err(|e| {
                        Error::WebRtc(format!("remove track {}: {e}", publisher.uid))
                    })?;
                    sub_state.publishers.remove(publisher.uid());
                    renegotiate = true;
                }
            }

            if let Some(track) = &pub_state.track {
                if old.as_ref().map(|o| o.id.as_str()) != Some(pub_state.cid.as_str()) {
                    let sender = self
                        .pc
                        .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                        .await
                        .map_err(|e| {
                            Error::WebRtc(format!("add track {}: {e}", publisher.uid))
                        })?;
                    info!(
                        sub = %self.uid,
                        publisher = %publisher.uid,
                        cid = %pub_state.cid,
                        "publisher track attached"
                    );
                    let attached = sender.track().await.map(|t| t.id().to_string());
                    if attached.as_deref() != Some(pub_state.cid.as_str()) {
                        return Err(Error::WebRtc(format!(
                            "malformed peer and track id {} {:?}",
                            pub_state.cid, attached
                        )));
                    }
                    sub_state.publishers.insert(
                        publisher.uid.clone(),
                        SenderHandle {
                            id: pub_state.cid.clone(),
                            rtp: sender,
                        },
                    );
                    renegotiate = true;
                }
            }
            Ok(renegotiate)
        })
        .await
    }
}

/// Set a local description and wait for ICE gathering to finish, so every
/// candidate is serialised into the SDP and no server-side trickle is needed.
/// The promise is armed before the description is set.
pub(crate) async fn set_local_description(
    pc: &RTCPeerConnection,
    desc: RTCSessionDescription,
) -> std::result::Result<(), webrtc::Error> {
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(desc).await?;
    let _ = gather_complete.recv().await;
    Ok(())
}
