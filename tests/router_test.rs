//! End-to-end signalling scenarios against real peer connections
//!
//! These tests negotiate with the router the way a browser would: a
//! client-side peer connection produces a gathered Opus offer, and the
//! router answers it. No media flows; the tests exercise the signalling
//! surface and the room bookkeeping around it.

use chorus_sfu::config::EngineConfig;
use chorus_sfu::engine::Engine;
use chorus_sfu::error::Error;
use chorus_sfu::router::Router;
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn test_router() -> Router {
    Router::new(Engine::new(&EngineConfig::default()))
}

/// Client-side peer connection with one Opus send track and a fully
/// gathered local offer, serialised the way a browser hands it over.
async fn client_offer() -> (Arc<RTCPeerConnection>, String) {
    let mut media = MediaEngine::default();
    media.register_default_codecs().unwrap();
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    );
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_string(),
        "client".to_string(),
    ));
    pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .unwrap();

    let offer = pc.create_offer(None).await.unwrap();
    let mut gather_complete = pc.gathering_complete_promise().await;
    pc.set_local_description(offer).await.unwrap();
    let _ = gather_complete.recv().await;

    let local = pc.local_description().await.unwrap();
    (pc, serde_json::to_string(&local).unwrap())
}

#[tokio::test]
async fn test_publish_returns_track_and_answer() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;

    let (cid, answer) = router
        .publish("room-1", "alice", &jsep, 0, None, false)
        .await
        .unwrap();

    assert!(Uuid::parse_str(&cid).is_ok());
    assert_eq!(answer.sdp_type, RTCSdpType::Answer);
    assert!(answer.sdp.contains("m=audio"));

    let peers = router.list("room-1").await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].id, "alice");
    assert_eq!(peers[0].track, cid);
    assert!(!peers[0].mute);
}

#[tokio::test]
async fn test_publish_rejects_bad_ids_and_sdp() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;

    let err = router
        .publish("room 1", "alice", &jsep, 0, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParams(_)));

    let err = router
        .publish("room-1", "alice", "{bad jsep", 0, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSdp(_)));
}

#[tokio::test]
async fn test_room_limit_is_enforced() {
    let router = test_router();

    let (_a, offer_a) = client_offer().await;
    router
        .publish("room-limit", "alice", &offer_a, 0, None, false)
        .await
        .unwrap();

    let (_b, offer_b) = client_offer().await;
    router
        .publish("room-limit", "bob", &offer_b, 2, None, false)
        .await
        .unwrap();

    let peers = router.list("room-limit").await.unwrap();
    assert_eq!(peers.len(), 2);

    let (_c, offer_c) = client_offer().await;
    let err = router
        .publish("room-limit", "carol", &offer_c, 2, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RoomFull(_)));
    assert_eq!(err.code(), 4290);

    // The limit excludes the caller's own uid: bob can re-publish.
    let (_b2, offer_b2) = client_offer().await;
    router
        .publish("room-limit", "bob", &offer_b2, 2, None, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_republish_replaces_and_closes_prior_peer() {
    let router = test_router();

    let (_pc1, offer1) = client_offer().await;
    let (old_cid, _) = router
        .publish("room-re", "alice", &offer1, 0, None, false)
        .await
        .unwrap();

    let (_pc2, offer2) = client_offer().await;
    let (new_cid, _) = router
        .publish("room-re", "alice", &offer2, 0, None, false)
        .await
        .unwrap();
    assert_ne!(old_cid, new_cid);

    let peers = router.list("room-re").await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].track, new_cid);

    // The prior incarnation's cid no longer matches the room entry.
    let err = router
        .subscribe("room-re", "alice", &old_cid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TrackNotFound { .. }));
}

#[tokio::test]
async fn test_mute_toggles_listen_only() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;
    let (cid, _) = router
        .publish("room-mute", "alice", &jsep, 0, None, false)
        .await
        .unwrap();

    let peer = router.mute("room-mute", "alice").await.unwrap();
    assert_eq!(peer.id, "alice");
    assert_eq!(peer.track, cid);
    assert!(peer.mute);

    let peer = router.mute("room-mute", "alice").await.unwrap();
    assert!(!peer.mute);

    let err = router.mute("room-mute", "nobody").await.unwrap_err();
    assert!(matches!(err, Error::PeerNotFound { .. }));
}

#[tokio::test]
async fn test_subscribe_checks_cid() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;
    let (cid, _) = router
        .publish("room-sub", "alice", &jsep, 0, None, false)
        .await
        .unwrap();

    let err = router
        .subscribe("room-sub", "alice", &Uuid::new_v4().to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TrackNotFound { .. }));

    let err = router
        .subscribe("room-sub", "ghost", &cid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerNotFound { .. }));

    // With no publishing tracks yet there is nothing to renegotiate; the
    // local description from publish is returned as-is.
    let desc = router.subscribe("room-sub", "alice", &cid).await.unwrap();
    assert_eq!(desc.sdp_type, RTCSdpType::Answer);
}

#[tokio::test]
async fn test_trickle_empty_candidate_is_a_noop() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;
    let (cid, _) = router
        .publish("room-trickle", "alice", &jsep, 0, None, false)
        .await
        .unwrap();

    router
        .trickle("room-trickle", "alice", &cid, "")
        .await
        .unwrap();
    router
        .trickle("room-trickle", "alice", &cid, r#"{"candidate":""}"#)
        .await
        .unwrap();

    let err = router
        .trickle("room-trickle", "alice", &cid, "{broken")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCandidate(_)));
}

#[tokio::test]
async fn test_end_closes_peer_and_poisons_lookups() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;
    let (cid, _) = router
        .publish("room-end", "alice", &jsep, 0, None, false)
        .await
        .unwrap();

    router.end("room-end", "alice", &cid).await.unwrap();

    // Closed peers disappear from list but stay in the room as CLOSED.
    let peers = router.list("room-end").await.unwrap();
    assert!(peers.is_empty());

    let err = router
        .subscribe("room-end", "alice", &cid)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerClosed { .. }));
    assert_eq!(err.code(), 4042);

    let err = router.end("room-end", "alice", &cid).await.unwrap_err();
    assert!(matches!(err, Error::PeerClosed { .. }));
}

#[tokio::test]
async fn test_restart_validates_lookup_and_jsep() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;
    let (cid, _) = router
        .publish("room-restart", "alice", &jsep, 0, None, false)
        .await
        .unwrap();

    let err = router
        .restart("room-restart", "alice", &Uuid::new_v4().to_string(), &jsep)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TrackNotFound { .. }));

    let answer_jsep = serde_json::json!({
        "type": "answer",
        "sdp": "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
    })
    .to_string();
    let err = router
        .restart("room-restart", "alice", &cid, &answer_jsep)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSdp(_)));
}

#[tokio::test]
async fn test_answer_requires_answer_type() {
    let router = test_router();
    let (_pc, jsep) = client_offer().await;
    let (cid, _) = router
        .publish("room-answer", "alice", &jsep, 0, None, false)
        .await
        .unwrap();

    // An offer-typed jsep on the answer verb is rejected before any lookup.
    let err = router
        .answer("room-answer", "alice", &cid, &jsep)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSdp(_)));
}
