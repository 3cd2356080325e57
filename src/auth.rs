//! Stateless login and bearer credentials.
//!
//! Nonces are not stored: `GET /auth/nonce` hands out an HMAC envelope
//! carrying the nonce and its issuance time, and `POST /auth/verify`
//! checks the envelope against the server key. Bearer tokens are the same
//! trick over the session claims, so a restart invalidates nothing.

use crate::error::{AppError, AppResult};
use crate::identity::{normalize_address, parse_address};
use crate::types::{LoginMessage, NonceResponse};
use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use ethers::core::types::Signature;
use hkdf::Hkdf;
use ring::hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;
use uuid::Uuid;

/// How long an issued nonce stays redeemable.
const NONCE_TTL_SECS: i64 = 300;

#[derive(Clone)]
pub struct AuthKeys {
    nonce_key: hmac::Key,
    token_key: hmac::Key,
}

impl AuthKeys {
    /// Derives the two MAC subkeys from the configured server key, with
    /// domain separation so a nonce envelope can never pass as a token.
    pub fn from_server_key(server_key: &str) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(b"votara-auth-v1"), server_key.as_bytes());
        let mut nonce = [0u8; 32];
        hk.expand(b"nonce-envelope", &mut nonce)
            .expect("HKDF expand should never fail with valid length");
        let mut token = [0u8; 32];
        hk.expand(b"bearer-token", &mut token)
            .expect("HKDF expand should never fail with valid length");
        Self {
            nonce_key: hmac::Key::new(hmac::HMAC_SHA256, &nonce),
            token_key: hmac::Key::new(hmac::HMAC_SHA256, &token),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    pub address: String,
    pub chain_id: u64,
    pub exp: i64,
}

pub fn issue_nonce(keys: &AuthKeys, now: DateTime<Utc>) -> NonceResponse {
    let nonce = Uuid::new_v4().simple().to_string();
    let payload = format!("{nonce}.{}", now.timestamp());
    let tag = hmac::sign(&keys.nonce_key, payload.as_bytes());
    NonceResponse {
        nonce,
        signed_nonce: format!(
            "{}.{}",
            hex::encode(payload.as_bytes()),
            hex::encode(tag.as_ref())
        ),
    }
}

pub fn verify_nonce(
    keys: &AuthKeys,
    signed_nonce: &str,
    expected_nonce: &str,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let (payload_hex, tag_hex) = signed_nonce
        .split_once('.')
        .ok_or_else(|| AppError::Unauthorized("malformed nonce envelope".into()))?;
    let payload = hex::decode(payload_hex)
        .map_err(|_| AppError::Unauthorized("malformed nonce envelope".into()))?;
    let tag = hex::decode(tag_hex)
        .map_err(|_| AppError::Unauthorized("malformed nonce envelope".into()))?;
    hmac::verify(&keys.nonce_key, &payload, &tag)
        .map_err(|_| AppError::Unauthorized("nonce was not issued by this server".into()))?;

    let payload = String::from_utf8(payload)
        .map_err(|_| AppError::Unauthorized("malformed nonce envelope".into()))?;
    let (nonce, issued_at) = payload
        .split_once('.')
        .ok_or_else(|| AppError::Unauthorized("malformed nonce envelope".into()))?;
    if nonce != expected_nonce {
        return Err(AppError::Unauthorized("nonce mismatch".into()));
    }
    let issued_at: i64 = issued_at
        .parse()
        .map_err(|_| AppError::Unauthorized("malformed nonce envelope".into()))?;
    let age = now.timestamp() - issued_at;
    if !(0..=NONCE_TTL_SECS).contains(&age) {
        return Err(AppError::Unauthorized("nonce expired".into()));
    }
    Ok(())
}

/// Renders the exact text the wallet signed. Any field drift changes the
/// digest, so the claimed fields are covered by the signature.
pub fn canonical_message(message: &LoginMessage) -> String {
    format!(
        "{} wants you to sign in with your account:\n{}\n\nNonce: {}\nChain ID: {}\nIssued At: {}",
        message.domain,
        message.address,
        message.nonce,
        message.chain_id,
        message.issued_at.to_rfc3339(),
    )
}

/// Full login check: envelope, nonce binding, then an EIP-191 recovery of
/// the claimed address. Returns the normalized address on success.
pub fn verify_login(
    keys: &AuthKeys,
    message: &LoginMessage,
    signature: &str,
    signed_nonce: &str,
    now: DateTime<Utc>,
) -> AppResult<String> {
    verify_nonce(keys, signed_nonce, &message.nonce, now)?;
    let address = parse_address(&message.address)?;
    let signature = Signature::from_str(signature.trim_start_matches("0x"))
        .map_err(|e| AppError::Unauthorized(format!("malformed signature: {e}")))?;
    signature
        .verify(canonical_message(message), address)
        .map_err(|_| AppError::Unauthorized("signature does not match the claimed address".into()))?;
    Ok(normalize_address(address))
}

pub fn mint_token(
    keys: &AuthKeys,
    address: &str,
    chain_id: u64,
    ttl: Duration,
    now: DateTime<Utc>,
) -> (String, DateTime<Utc>) {
    let expires_at = now + ttl;
    let claims = AuthClaims {
        address: address.to_string(),
        chain_id,
        exp: expires_at.timestamp(),
    };
    let payload = serde_json::to_vec(&claims).expect("claims serialize");
    let tag = hmac::sign(&keys.token_key, &payload);
    let token = format!("{}.{}", hex::encode(payload), hex::encode(tag.as_ref()));
    (token, expires_at)
}

pub fn verify_token(keys: &AuthKeys, token: &str, now: DateTime<Utc>) -> AppResult<AuthClaims> {
    let (payload_hex, tag_hex) = token
        .split_once('.')
        .ok_or_else(|| AppError::Unauthorized("malformed token".into()))?;
    let payload = hex::decode(payload_hex)
        .map_err(|_| AppError::Unauthorized("malformed token".into()))?;
    let tag =
        hex::decode(tag_hex).map_err(|_| AppError::Unauthorized("malformed token".into()))?;
    hmac::verify(&keys.token_key, &payload, &tag)
        .map_err(|_| AppError::Unauthorized("invalid token".into()))?;
    let claims: AuthClaims = serde_json::from_slice(&payload)
        .map_err(|_| AppError::Unauthorized("malformed token".into()))?;
    if claims.exp <= now.timestamp() {
        return Err(AppError::Unauthorized("token expired".into()));
    }
    Ok(claims)
}

/// Decodes and verifies the bearer credential on a request. Pure key
/// check; no store round-trip.
pub fn require_auth(headers: &HeaderMap, keys: &AuthKeys) -> AppResult<AuthClaims> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing bearer credential".into()))?;
    let token = raw
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Unauthorized("invalid authorization header".into()))?;
    verify_token(keys, token, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    fn keys() -> AuthKeys {
        AuthKeys::from_server_key("test-server-key")
    }

    #[test]
    fn nonce_roundtrip_and_expiry() {
        let keys = keys();
        let now = Utc::now();
        let issued = issue_nonce(&keys, now);
        assert!(issued.signed_nonce.len() >= 64);
        verify_nonce(&keys, &issued.signed_nonce, &issued.nonce, now).unwrap();

        let err = verify_nonce(&keys, &issued.signed_nonce, "other-nonce", now).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let late = now + Duration::seconds(NONCE_TTL_SECS + 1);
        let err = verify_nonce(&keys, &issued.signed_nonce, &issued.nonce, late).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn tampered_envelope_is_rejected() {
        let keys = keys();
        let now = Utc::now();
        let issued = issue_nonce(&keys, now);
        let mut forged = issued.signed_nonce.clone();
        forged.replace_range(0..2, "ff");
        assert!(verify_nonce(&keys, &forged, &issued.nonce, now).is_err());
    }

    #[test]
    fn token_roundtrip_and_expiry() {
        let keys = keys();
        let now = Utc::now();
        let (token, expires_at) = mint_token(&keys, "0xabc", 31337, Duration::days(7), now);
        assert!(expires_at > now);
        let claims = verify_token(&keys, &token, now).unwrap();
        assert_eq!(claims.address, "0xabc");
        assert_eq!(claims.chain_id, 31337);

        let err = verify_token(&keys, &token, expires_at).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(verify_token(&keys, "garbage", now).is_err());
        assert!(verify_token(&keys, "deadbeef.feed", now).is_err());
    }

    #[tokio::test]
    async fn login_verifies_a_wallet_signature() {
        let keys = keys();
        let now = Utc::now();
        let wallet = LocalWallet::from_str(
            "0x0123456789012345678901234567890123456789012345678901234567890123",
        )
        .unwrap();
        let issued = issue_nonce(&keys, now);
        let message = LoginMessage {
            domain: "votara.test".into(),
            address: format!("{:#x}", wallet.address()),
            nonce: issued.nonce.clone(),
            chain_id: 31337,
            issued_at: now,
        };
        let signature = wallet
            .sign_message(canonical_message(&message))
            .await
            .unwrap();
        let address = verify_login(
            &keys,
            &message,
            &signature.to_string(),
            &issued.signed_nonce,
            now,
        )
        .unwrap();
        assert_eq!(address, format!("{:#x}", wallet.address()));

        // A different wallet's signature over the same message must fail.
        let other = LocalWallet::from_str(
            "0x1111111111111111111111111111111111111111111111111111111111111111",
        )
        .unwrap();
        let forged = other
            .sign_message(canonical_message(&message))
            .await
            .unwrap();
        let err = verify_login(
            &keys,
            &message,
            &forged.to_string(),
            &issued.signed_nonce,
            now,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
