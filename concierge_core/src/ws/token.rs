//! Short-lived, single-use tokens for WebSocket stream authorization.
//!
//! A token binds a user, task id, and hostname together with an expiry and a
//! random nonce, signed with HMAC-SHA256. Verification checks the
//! signature, the expiry, and — critically — that the nonce has not been
//! seen before, so a captured token can't be replayed to open a second
//! connection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::ConciergeError;

type HmacSha256 = Hmac<Sha256>;

/// The claims carried by a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub user: String,
    pub task_id: String,
    pub hostname: String,
    pub exp: i64,
}

/// Issues and verifies WebSocket stream tokens, tracking consumed nonces in
/// memory for the lifetime of the process.
pub struct TokenIssuer {
    secret: Vec<u8>,
    seen: Mutex<HashMap<String, i64>>,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a token valid for `ttl`, bound to `user`/`task_id`/`hostname`.
    pub fn issue(&self, user: &str, task_id: &str, hostname: &str, ttl: Duration, now: i64) -> String {
        let exp = now + ttl.as_secs() as i64;
        let nonce = random_nonce();
        let payload = format!("{user}:{task_id}:{hostname}:{exp}:{nonce}");
        let sig = hex::encode(sign(&self.secret, &payload));
        let combined = format!("{payload}:{sig}");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(combined)
    }

    /// Verifies `token` against `hostname`, consuming its nonce on success.
    /// A second verification of the same token will fail with
    /// [`ConciergeError::TokenReplay`].
    pub fn verify(&self, token: &str, hostname: &str, now: i64) -> Result<TokenGrant, ConciergeError> {
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| ConciergeError::TokenInvalid(e.to_string()))?;
        let combined = String::from_utf8(decoded).map_err(|e| ConciergeError::TokenInvalid(e.to_string()))?;

        let parts: Vec<&str> = combined.split(':').collect();
        let [user, task_id, token_hostname, exp_str, nonce, sig_hex] = parts.as_slice() else {
            return Err(ConciergeError::TokenInvalid("malformed token".to_string()));
        };

        let payload = format!("{user}:{task_id}:{token_hostname}:{exp_str}:{nonce}");
        let expected = sign(&self.secret, &payload);
        let given = hex::decode(sig_hex).map_err(|e| ConciergeError::TokenInvalid(e.to_string()))?;
        if expected.len() != given.len() || !constant_time_eq(&expected, &given) {
            return Err(ConciergeError::TokenInvalid("signature mismatch".to_string()));
        }

        if *token_hostname != hostname {
            return Err(ConciergeError::TokenInvalid("hostname mismatch".to_string()));
        }

        let exp: i64 = exp_str.parse().map_err(|_| ConciergeError::TokenInvalid("bad exp".to_string()))?;
        if exp < now {
            return Err(ConciergeError::TokenExpired);
        }

        let mut seen = self.seen.lock().expect("token nonce lock poisoned");
        seen.retain(|_, exp| *exp >= now);
        if seen.contains_key(*nonce) {
            return Err(ConciergeError::TokenReplay);
        }
        seen.insert(nonce.to_string(), exp);

        Ok(TokenGrant {
            user: user.to_string(),
            task_id: task_id.to_string(),
            hostname: token_hostname.to_string(),
            exp,
        })
    }
}

fn sign(secret: &[u8], payload: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_once() {
        let issuer = TokenIssuer::new(b"secret".to_vec());
        let token = issuer.issue("alice", "task1", "host1", Duration::from_secs(60), 1000);
        let grant = issuer.verify(&token, "host1", 1000).unwrap();
        assert_eq!(grant.user, "alice");
        assert_eq!(grant.task_id, "task1");
    }

    #[test]
    fn replayed_token_is_rejected() {
        let issuer = TokenIssuer::new(b"secret".to_vec());
        let token = issuer.issue("alice", "task1", "host1", Duration::from_secs(60), 1000);
        issuer.verify(&token, "host1", 1000).unwrap();
        let err = issuer.verify(&token, "host1", 1000).unwrap_err();
        assert!(matches!(err, ConciergeError::TokenReplay));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = TokenIssuer::new(b"secret".to_vec());
        let token = issuer.issue("alice", "task1", "host1", Duration::from_secs(10), 1000);
        let err = issuer.verify(&token, "host1", 2000).unwrap_err();
        assert!(matches!(err, ConciergeError::TokenExpired));
    }

    #[test]
    fn tampered_token_is_rejected() {
        let issuer = TokenIssuer::new(b"secret".to_vec());
        let mut token = issuer.issue("alice", "task1", "host1", Duration::from_secs(60), 1000);
        token.push('x');
        assert!(issuer.verify(&token, "host1", 1000).is_err());
    }

    #[test]
    fn hostname_mismatch_is_rejected() {
        let issuer = TokenIssuer::new(b"secret".to_vec());
        let token = issuer.issue("alice", "task1", "host1", Duration::from_secs(60), 1000);
        let err = issuer.verify(&token, "other-host", 1000).unwrap_err();
        assert!(matches!(err, ConciergeError::TokenInvalid(_)));
    }
}
