//! Signalling operations against rooms and peers
//!
//! The Router implements the RPC verbs: publish, restart, end, trickle,
//! subscribe, answer, list, mute, info. It owns the peer-connection factory
//! (ICE-Lite settings, Opus-only media engine) and drives every
//! peer-connection call through the timeout harness.

use crate::engine::{Engine, State};
use crate::error::{Error, Result};
use crate::peer::{self, Peer};
use crate::timeout::{self, CONNECT};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

const MAX_ID_LENGTH: usize = 256;

/// Client-facing descriptor of a live peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub track: String,
    pub mute: bool,
}

/// Signalling front-end over the engine
pub struct Router {
    engine: Arc<Engine>,
}

impl Router {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Last snapshot from the state monitor
    pub async fn info(&self) -> State {
        self.engine.state().await
    }

    /// Every peer in the room with a live track id
    pub async fn list(&self, rid: &str) -> Result<Vec<PeerInfo>> {
        let room = self.engine.rooms().get_or_create(rid).await;
        let peers = room.peers_snapshot().await;

        let mut list = Vec::new();
        for peer in peers.values() {
            let (cid, listen_only) = peer.snapshot().await;
            if !is_valid_track_id(&cid) {
                continue;
            }
            list.push(PeerInfo {
                id: peer.uid().to_string(),
                track: cid,
                mute: listen_only,
            });
        }
        Ok(list)
    }

    /// Toggle the provisional mute on the room's peer with this uid
    pub async fn mute(&self, rid: &str, uid: &str) -> Result<PeerInfo> {
        let room = self.engine.rooms().get_or_create(rid).await;
        let peers = room.peers_snapshot().await;

        for peer in peers.values() {
            if peer.uid() != uid {
                continue;
            }
            let (cid, _) = peer.snapshot().await;
            if !is_valid_track_id(&cid) {
                continue;
            }
            let (_, listen_only) = peer.toggle_listen_only().await;
            return Ok(PeerInfo {
                id: peer.uid().to_string(),
                track: cid,
                mute: listen_only,
            });
        }
        Err(Error::PeerNotFound {
            rid: rid.to_string(),
            uid: uid.to_string(),
        })
    }

    /// Create a Peer for this (rid, uid) from the client's offer, replacing
    /// and closing any prior incarnation. Returns the new cid and the local
    /// answer with gathering complete.
    pub async fn publish(
        &self,
        rid: &str,
        uid: &str,
        jsep: &str,
        limit: i64,
        callback: Option<String>,
        listen_only: bool,
    ) -> Result<(String, RTCSessionDescription)> {
        validate_id(rid).map_err(|e| Error::InvalidParams(format!("invalid rid format {rid} {e}")))?;
        validate_id(uid).map_err(|e| Error::InvalidParams(format!("invalid uid format {uid} {e}")))?;
        let offer = parse_jsep(jsep, RTCSdpType::Offer)?;

        let room = self.engine.rooms().get_or_create(rid).await;
        if limit > 0 {
            let peers = room.peers_snapshot().await;
            let mut occupied: i64 = 0;
            for (id, peer) in &peers {
                let (cid, _) = peer.snapshot().await;
                if !is_valid_track_id(&cid) || id == uid {
                    continue;
                }
                occupied += 1;
            }
            if occupied >= limit {
                return Err(Error::RoomFull(format!("{limit}")));
            }
        }

        let mut guard = room.lock().await;
        let peer = timeout::run_with_timeout(
            CONNECT,
            self.create(rid, uid, callback, listen_only, offer),
        )
        .await?;
        let cid = peer.cid().await;
        let answer = peer
            .pc()
            .local_description()
            .await
            .ok_or_else(|| Error::WebRtc("local description unavailable".to_string()))?;

        let displaced = guard.insert_replacing(Arc::clone(&peer));
        drop(guard);
        if let Some(old) = displaced {
            let _ = old.close().await;
        }

        info!(rid = %rid, uid = %uid, cid = %cid, "peer published");
        Ok((cid, answer))
    }

    /// Apply an ICE-restart offer on an existing Peer
    pub async fn restart(
        &self,
        rid: &str,
        uid: &str,
        cid: &str,
        jsep: &str,
    ) -> Result<RTCSessionDescription> {
        let room = self.engine.rooms().get_or_create(rid).await;
        let peer = room.get_peer(uid, cid).await?;
        let offer = parse_jsep(jsep, RTCSdpType::Offer)?;
        peer.restart(offer).await
    }

    /// Terminate a Peer
    pub async fn end(&self, rid: &str, uid: &str, cid: &str) -> Result<()> {
        let room = self.engine.rooms().get_or_create(rid).await;
        let peer = room.get_peer(uid, cid).await?;
        peer.close().await
    }

    /// Add a trickled client candidate; an empty candidate is the
    /// end-of-candidates sentinel and succeeds with no side effect.
    pub async fn trickle(&self, rid: &str, uid: &str, cid: &str, candidate: &str) -> Result<()> {
        if candidate.is_empty() {
            return Ok(());
        }
        let init: RTCIceCandidateInit =
            serde_json::from_str(candidate).map_err(|e| Error::InvalidCandidate(e.to_string()))?;
        if init.candidate.is_empty() {
            return Ok(());
        }

        let room = self.engine.rooms().get_or_create(rid).await;
        let peer = room.get_peer(uid, cid).await?;
        peer.add_candidate(init).await
    }

    /// Wire this subscriber to every other publisher in the room,
    /// renegotiating if the sender set changed. Serialised with publish by
    /// the Room write lock.
    pub async fn subscribe(&self, rid: &str, uid: &str, cid: &str) -> Result<RTCSessionDescription> {
        let room = self.engine.rooms().get_or_create(rid).await;
        let guard = room.lock().await;
        let peer = guard.get_peer(uid, cid).await?;
        let peers = guard.peers_snapshot();

        let result = timeout::run_with_timeout(CONNECT, async {
            let result = peer.do_subscribe(&peers).await;
            info!(rid = %rid, uid = %uid, cid = %cid, ?result, "subscribe fan-out");
            if let Err(err) = result {
                let _ = peer.close().await;
                return Err(err);
            }
            Ok(())
        })
        .await;
        drop(guard);
        result?;

        peer.pc()
            .local_description()
            .await
            .ok_or_else(|| Error::WebRtc("local description unavailable".to_string()))
    }

    /// Apply the subscriber's answer to the server-side offer
    pub async fn answer(&self, rid: &str, uid: &str, cid: &str, jsep: &str) -> Result<()> {
        let answer = parse_jsep(jsep, RTCSdpType::Answer)?;
        let room = self.engine.rooms().get_or_create(rid).await;
        let peer = room.get_peer(uid, cid).await?;
        peer.apply_answer(answer).await
    }

    /// Build and negotiate a peer connection for a publisher, then wrap it
    /// in a Peer. Failures discard the half-built connection best-effort.
    async fn create(
        &self,
        rid: &str,
        uid: &str,
        callback: Option<String>,
        listen_only: bool,
        offer: RTCSessionDescription,
    ) -> Result<Arc<Peer>> {
        let pc = self.build_peer_connection().await?;

        if let Err(err) = pc.set_remote_description(offer).await {
            let _ = pc.close().await;
            return Err(Error::ServerSetRemoteOffer(err.to_string()));
        }
        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                let _ = pc.close().await;
                return Err(Error::ServerCreateAnswer(err.to_string()));
            }
        };
        if let Err(err) = peer::set_local_description(&pc, answer).await {
            let _ = pc.close().await;
            return Err(Error::ServerSetLocalAnswer(err.to_string()));
        }

        Ok(Peer::build(
            rid.to_string(),
            uid.to_string(),
            pc,
            callback,
            listen_only,
        ))
    }

    /// Peer-connection factory: ICE-Lite, host candidate on the configured
    /// public IP, restricted interface and UDP port range, Opus registered
    /// under both browser payload-type mappings, max-bundle, RTCP-mux.
    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut settings = SettingEngine::default();
        settings.set_lite(true);
        let interface = self.engine.interface.clone();
        settings.set_interface_filter(Box::new(move |name: &str| name == interface));
        settings.set_nat_1to1_ips(vec![self.engine.ip.clone()], RTCIceCandidateType::Host);
        settings.set_ice_timeouts(
            Some(Duration::from_secs(10)),
            Some(Duration::from_secs(20)),
            Some(Duration::from_secs(2)),
        );
        settings.set_receive_mtu(8192);
        let ephemeral = EphemeralUDP::new(self.engine.port_min, self.engine.port_max)
            .map_err(|e| Error::ServerNewPeerConnection(e.to_string()))?;
        settings.set_udp_network(UDPNetwork::Ephemeral(ephemeral));

        let mut media = MediaEngine::default();
        for payload_type in [111u8, 109u8] {
            media
                .register_codec(
                    RTCRtpCodecParameters {
                        capability: RTCRtpCodecCapability {
                            mime_type: MIME_TYPE_OPUS.to_owned(),
                            clock_rate: 48000,
                            channels: 2,
                            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                            rtcp_feedback: vec![],
                        },
                        payload_type,
                        ..Default::default()
                    },
                    RTPCodecType::Audio,
                )
                .map_err(|e| Error::ServerNewPeerConnection(e.to_string()))?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)
            .map_err(|e| Error::ServerNewPeerConnection(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_setting_engine(settings)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| Error::ServerNewPeerConnection(e.to_string()))?;
        Ok(Arc::new(pc))
    }
}

/// Parse a JSON-wrapped session description, requiring the given type and a
/// well-formed SDP body.
fn parse_jsep(jsep: &str, expected: RTCSdpType) -> Result<RTCSessionDescription> {
    let desc: RTCSessionDescription =
        serde_json::from_str(jsep).map_err(|e| Error::InvalidSdp(e.to_string()))?;
    if desc.sdp_type != expected {
        return Err(Error::InvalidSdp(format!(
            "invalid sdp type {}",
            desc.sdp_type
        )));
    }
    desc.unmarshal()
        .map_err(|e| Error::InvalidSdp(e.to_string()))?;
    Ok(desc)
}

/// An id is opaque but must be short and URL-query-escape round-trip equal.
fn validate_id(id: &str) -> std::result::Result<(), String> {
    if id.len() > MAX_ID_LENGTH {
        return Err(format!(
            "id {id} too long, the maximum is {MAX_ID_LENGTH}"
        ));
    }
    let decoded = urlencoding::decode(id).map_err(|e| e.to_string())?;
    let encoded = urlencoding::encode(&decoded);
    if encoded != id {
        return Err(format!("unmatch {id} {encoded}"));
    }
    Ok(())
}

/// A track id is live when it is a real (non-nil) UUID; the CLOSED sentinel
/// never parses.
fn is_valid_track_id(cid: &str) -> bool {
    matches!(Uuid::parse_str(cid), Ok(id) if !id.is_nil())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_accepts_plain_ids() {
        assert!(validate_id("room-1").is_ok());
        assert!(validate_id("alice").is_ok());
        assert!(validate_id("5a9e6b5c-6b9e-4a8e-bb5f-000000000001").is_ok());
    }

    #[test]
    fn test_validate_id_rejects_unescaped_input() {
        assert!(validate_id("room 1").is_err());
        assert!(validate_id("a/b").is_err());
    }

    #[test]
    fn test_validate_id_rejects_long_ids() {
        let id = "a".repeat(MAX_ID_LENGTH + 1);
        assert!(validate_id(&id).is_err());
        let id = "a".repeat(MAX_ID_LENGTH);
        assert!(validate_id(&id).is_ok());
    }

    #[test]
    fn test_is_valid_track_id() {
        assert!(is_valid_track_id(&Uuid::new_v4().to_string()));
        assert!(!is_valid_track_id(crate::peer::TRACK_CLOSED_ID));
        assert!(!is_valid_track_id(&Uuid::nil().to_string()));
        assert!(!is_valid_track_id("not-a-uuid"));
    }

    #[test]
    fn test_parse_jsep_rejects_invalid_json() {
        let err = parse_jsep("{not json", RTCSdpType::Offer).unwrap_err();
        assert!(matches!(err, Error::InvalidSdp(_)));
        assert_eq!(err.code(), 4002);
    }

    #[test]
    fn test_parse_jsep_rejects_wrong_type() {
        let jsep = serde_json::json!({
            "type": "answer",
            "sdp": "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
        })
        .to_string();
        let err = parse_jsep(&jsep, RTCSdpType::Offer).unwrap_err();
        assert!(matches!(err, Error::InvalidSdp(_)));
    }
}
