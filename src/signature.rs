// src/signature.rs
use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::{RngCore, rng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

pub const TIMESTAMP_HEADER: &str = "X-Switchboard-Request-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Switchboard-Signature";

/// Signatures older (or newer) than this are rejected.
const MAX_SKEW_SECS: u64 = 300;

type HmacSha256 = Hmac<Sha256>;

/// The authenticity header pair attached to every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SignatureHeaders {
    pub timestamp: String,
    pub signature: String,
}

impl SignatureHeaders {
    pub fn as_pairs(&self) -> [(&'static str, String); 2] {
        [
            (TIMESTAMP_HEADER, self.timestamp.clone()),
            (SIGNATURE_HEADER, self.signature.clone()),
        ]
    }
}

/// Signs serialized envelope bodies with `v0:{timestamp}:{body}` HMAC-SHA256.
#[derive(Clone)]
pub struct Signer {
    secret: Arc<Vec<u8>>,
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self { secret: Arc::new(secret.as_ref().to_vec()) }
    }

    /// A signer with a per-process random secret.
    pub fn random() -> Self {
        Self::new(Self::generate_secret())
    }

    /// 32 random bytes, hex encoded.
    pub fn generate_secret() -> String {
        let mut secret = [0u8; 32];
        rng().fill_bytes(&mut secret);
        secret.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn sign(&self, body: &str) -> SignatureHeaders {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.sign_at(body, now)
    }

    pub fn sign_at(&self, body: &str, timestamp: u64) -> SignatureHeaders {
        let timestamp = timestamp.to_string();
        let signature = self.compute(&timestamp, body);
        SignatureHeaders { timestamp, signature }
    }

    pub fn verify(&self, headers: &SignatureHeaders, body: &str) -> bool {
        let Ok(ts) = headers.timestamp.parse::<u64>() else {
            return false;
        };
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if now.abs_diff(ts) > MAX_SKEW_SECS {
            warn!("signature expired: {} vs now {}", ts, now);
            return false;
        }
        let expected = self.compute(&headers.timestamp, body);
        constant_time_eq(&expected, &headers.signature)
    }

    fn compute(&self, timestamp: &str, body: &str) -> String {
        // HMAC takes keys of any length.
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return String::new();
        };
        mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
        format!("v0={:x}", mac.finalize().into_bytes())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Signer(..)")
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
