//! TURN credential issuance
//!
//! Stateless helper that signs short-lived credentials for an external
//! coturn relay running in static-auth-secret mode: the username is
//! `"<expiry-unix>:<uid>"` and the credential is
//! `base64(HMAC-SHA1(secret, username))`.

use crate::config::TurnConfig;
use crate::error::{Error, Result};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha1::Sha1;

/// One relay entry of the ICE server list returned by the `turn` RPC
#[derive(Debug, Clone, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Issue the ICE server list for a participant. An unconfigured relay
/// yields an empty list so browser clients fall back to the host candidate.
pub fn ice_servers(conf: &TurnConfig, uid: &str) -> Result<Vec<IceServer>> {
    if conf.host.is_empty() || conf.secret.is_empty() {
        return Ok(Vec::new());
    }

    let expiry = Utc::now().timestamp() + conf.ttl_seconds as i64;
    let username = format!("{expiry}:{uid}");
    let credential = sign(&conf.secret, &username)?;

    Ok(vec![IceServer {
        urls: vec![conf.host.clone()],
        username,
        credential,
    }])
}

fn sign(secret: &str, username: &str) -> Result<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::InvalidParams(format!("turn secret: {e}")))?;
    mac.update(username.as_bytes());
    let digest = mac.finalize();
    Ok(base64::engine::general_purpose::STANDARD.encode(digest.into_bytes()))
}
