#![forbid(unsafe_code)]

// Capability tokens gating WebSocket admission.
//
// Format: <payloadB64>.<sigB64>, both segments URL-safe base64 without
// padding; the signature is HMAC-SHA256 over the payload segment. Tokens are
// single-use: the jti nonce is consumed on verification and rejected again
// until its exp passes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Allowance for tokens minted by a clock slightly ahead of ours.
const IAT_SKEW_SECS: u64 = 30;

/// Verification failures. Display strings are the close-frame reason surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("bad_format")]
    BadFormat,
    #[error("bad_sig")]
    BadSig,
    #[error("no_{0}")]
    MissingField(&'static str),
    #[error("expired")]
    Expired,
    #[error("iat_in_future")]
    IatInFuture,
    #[error("roomId_mismatch")]
    RoomIdMismatch,
    #[error("peerId_mismatch")]
    PeerIdMismatch,
    #[error("sessionId_mismatch")]
    SessionIdMismatch,
    #[error("replayed")]
    Replayed,
}

/// Verified token payload binding a connection to a room and peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub room_id: String,
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub jti: String,
    pub iat: u64,
    pub exp: u64,
}

/// Expected bindings checked during verification; all optional.
#[derive(Debug, Default, Clone, Copy)]
pub struct Expect<'a> {
    pub room_id: Option<&'a str>,
    pub peer_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

/// Signs and verifies connection tokens under a process-wide shared secret,
/// and enforces single-use jti semantics with an in-memory nonce table.
pub struct TokenCodec {
    secret: Vec<u8>,
    /// jti -> exp of consumed nonces, reaped once exp passes.
    nonces: Mutex<HashMap<String, u64>>,
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Mints a token: encode payload, sign, concatenate.
    pub fn sign(&self, claims: &TokenClaims) -> String {
        let payload = serde_json::to_vec(claims).expect("claims serialize to JSON");
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(payload_b64.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{payload_b64}.{sig_b64}")
    }

    /// Verifies a token against the system clock.
    pub fn verify(
        &self,
        token: &str,
        expect: Expect<'_>,
        consume_jti: bool,
    ) -> Result<TokenClaims, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.verify_at(token, now, expect, consume_jti)
    }

    /// Verification steps, in order: segment format, signature (constant
    /// time), payload fields, expiry, iat skew, expected bindings, nonce
    /// consumption.
    pub fn verify_at(
        &self,
        token: &str,
        now: u64,
        expect: Expect<'_>,
        consume_jti: bool,
    ) -> Result<TokenClaims, TokenError> {
        let mut segments = token.split('.');
        let (payload_b64, sig_b64) = match (segments.next(), segments.next(), segments.next()) {
            (Some(payload), Some(sig), None) => (payload, sig),
            _ => return Err(TokenError::BadFormat),
        };

        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::BadFormat)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(payload_b64.as_bytes());
        // verify_slice compares in constant time
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSig)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::BadFormat)?;
        let value: Value =
            serde_json::from_slice(&payload).map_err(|_| TokenError::BadFormat)?;
        let map = value.as_object().ok_or(TokenError::BadFormat)?;

        let room_id = str_field(map, "roomId")?;
        let peer_id = str_field(map, "peerId")?;
        let session_id = match map.get("sessionId") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(TokenError::MissingField("sessionId")),
        };
        let jti = str_field(map, "jti")?;
        let iat = num_field(map, "iat")?;
        let exp = num_field(map, "exp")?;

        if exp <= now {
            return Err(TokenError::Expired);
        }
        if iat > now + IAT_SKEW_SECS {
            return Err(TokenError::IatInFuture);
        }

        if expect.room_id.is_some_and(|expected| expected != room_id) {
            return Err(TokenError::RoomIdMismatch);
        }
        if expect.peer_id.is_some_and(|expected| expected != peer_id) {
            return Err(TokenError::PeerIdMismatch);
        }
        if expect
            .session_id
            .is_some_and(|expected| Some(expected) != session_id.as_deref())
        {
            return Err(TokenError::SessionIdMismatch);
        }

        if consume_jti {
            let mut nonces = self.nonces.lock().unwrap_or_else(|e| e.into_inner());
            nonces.retain(|_, nonce_exp| *nonce_exp > now);
            if nonces.contains_key(&jti) {
                return Err(TokenError::Replayed);
            }
            nonces.insert(jti.clone(), exp);
        }

        Ok(TokenClaims {
            room_id,
            peer_id,
            session_id,
            jti,
            iat,
            exp,
        })
    }
}

fn str_field(map: &Map<String, Value>, name: &'static str) -> Result<String, TokenError> {
    map.get(name)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(TokenError::MissingField(name))
}

fn num_field(map: &Map<String, Value>, name: &'static str) -> Result<u64, TokenError> {
    map.get(name)
        .and_then(Value::as_u64)
        .ok_or(TokenError::MissingField(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new("test-secret".as_bytes().to_vec())
    }

    fn claims(jti: &str) -> TokenClaims {
        TokenClaims {
            room_id: "r1".to_string(),
            peer_id: "p1".to_string(),
            session_id: Some("s1".to_string()),
            jti: jti.to_string(),
            iat: 1000,
            exp: 1060,
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let codec = codec();
        let original = claims("j1");
        let token = codec.sign(&original);
        let verified = codec
            .verify_at(&token, 1005, Expect::default(), false)
            .unwrap();
        assert_eq!(verified, original);
    }

    #[test]
    fn rejects_wrong_segment_count() {
        let codec = codec();
        assert_eq!(
            codec.verify_at("just-one-segment", 1005, Expect::default(), false),
            Err(TokenError::BadFormat)
        );
        assert_eq!(
            codec.verify_at("a.b.c", 1005, Expect::default(), false),
            Err(TokenError::BadFormat)
        );
    }

    #[test]
    fn rejects_tampered_signature() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        let (payload, _) = token.split_once('.').unwrap();
        let forged = format!("{payload}.{}", URL_SAFE_NO_PAD.encode(b"not-the-mac"));
        assert_eq!(
            codec.verify_at(&forged, 1005, Expect::default(), false),
            Err(TokenError::BadSig)
        );
    }

    #[test]
    fn rejects_tampered_payload() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        let (_, sig) = token.split_once('.').unwrap();
        let other = serde_json::to_vec(&claims("j2")).unwrap();
        let forged = format!("{}.{sig}", URL_SAFE_NO_PAD.encode(other));
        assert_eq!(
            codec.verify_at(&forged, 1005, Expect::default(), false),
            Err(TokenError::BadSig)
        );
    }

    #[test]
    fn reports_missing_fields() {
        let codec = codec();
        let payload_b64 =
            URL_SAFE_NO_PAD.encode(br#"{"peerId":"p1","jti":"j1","iat":1,"exp":9999}"#);
        let mut mac = HmacSha256::new_from_slice(b"test-secret").unwrap();
        mac.update(payload_b64.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        let token = format!("{payload_b64}.{sig_b64}");
        assert_eq!(
            codec.verify_at(&token, 1005, Expect::default(), false),
            Err(TokenError::MissingField("roomId"))
        );
    }

    #[test]
    fn exp_equal_to_now_is_rejected() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        assert_eq!(
            codec.verify_at(&token, 1060, Expect::default(), false),
            Err(TokenError::Expired)
        );
        // one second earlier it is still valid
        assert!(codec
            .verify_at(&token, 1059, Expect::default(), false)
            .is_ok());
    }

    #[test]
    fn iat_skew_boundary() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        // iat == now + 30 is accepted
        assert!(codec
            .verify_at(&token, 970, Expect::default(), false)
            .is_ok());
        // iat == now + 31 is rejected
        assert_eq!(
            codec.verify_at(&token, 969, Expect::default(), false),
            Err(TokenError::IatInFuture)
        );
    }

    #[test]
    fn binding_mismatches() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        let expect_room = Expect {
            room_id: Some("other"),
            ..Expect::default()
        };
        assert_eq!(
            codec.verify_at(&token, 1005, expect_room, false),
            Err(TokenError::RoomIdMismatch)
        );
        let expect_peer = Expect {
            peer_id: Some("other"),
            ..Expect::default()
        };
        assert_eq!(
            codec.verify_at(&token, 1005, expect_peer, false),
            Err(TokenError::PeerIdMismatch)
        );
        let expect_session = Expect {
            session_id: Some("other"),
            ..Expect::default()
        };
        assert_eq!(
            codec.verify_at(&token, 1005, expect_session, false),
            Err(TokenError::SessionIdMismatch)
        );
    }

    #[test]
    fn matching_bindings_pass() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        let expect = Expect {
            room_id: Some("r1"),
            peer_id: Some("p1"),
            session_id: Some("s1"),
        };
        assert!(codec.verify_at(&token, 1005, expect, false).is_ok());
    }

    #[test]
    fn jti_is_single_use() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        assert!(codec
            .verify_at(&token, 1005, Expect::default(), true)
            .is_ok());
        assert_eq!(
            codec.verify_at(&token, 1006, Expect::default(), true),
            Err(TokenError::Replayed)
        );
    }

    #[test]
    fn verification_without_consumption_does_not_burn_jti() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        assert!(codec
            .verify_at(&token, 1005, Expect::default(), false)
            .is_ok());
        assert!(codec
            .verify_at(&token, 1005, Expect::default(), true)
            .is_ok());
    }

    #[test]
    fn consumed_jti_is_reaped_after_exp() {
        let codec = codec();
        let token = codec.sign(&claims("j1"));
        assert!(codec
            .verify_at(&token, 1005, Expect::default(), true)
            .is_ok());

        // a later verification of a different token reaps the expired nonce
        let fresh = codec.sign(&TokenClaims {
            iat: 2000,
            exp: 2060,
            ..claims("j2")
        });
        assert!(codec
            .verify_at(&fresh, 2005, Expect::default(), true)
            .is_ok());
        let nonces = codec.nonces.lock().unwrap();
        assert!(!nonces.contains_key("j1"));
        assert!(nonces.contains_key("j2"));
    }

    #[test]
    fn token_without_session_id_verifies() {
        let codec = codec();
        let token = codec.sign(&TokenClaims {
            session_id: None,
            ..claims("j1")
        });
        let verified = codec
            .verify_at(&token, 1005, Expect::default(), false)
            .unwrap();
        assert_eq!(verified.session_id, None);
    }
}
