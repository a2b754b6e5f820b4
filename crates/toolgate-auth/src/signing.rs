//! HMAC channel authentication for JSON-RPC messages.
//!
//! Peers sharing a secret stamp each outbound message with a monotonic `_seq`
//! and an HMAC-SHA256 `_hmac` over the canonical JSON form. Verification
//! requires both a matching tag and a sequence number strictly greater than
//! the last accepted one, which rejects replays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq as _;

type HmacSha256 = Hmac<Sha256>;

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

pub fn hex_to_bytes(s: &str) -> anyhow::Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        anyhow::bail!("hex string has odd length");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| anyhow::anyhow!("invalid hex byte at offset {i}"))
        })
        .collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    bytes_to_hex(&Sha256::digest(data))
}

/// Serialize with object keys sorted recursively, so signer and verifier
/// agree on the byte form regardless of map ordering.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{fields}}}")
        }
        Value::Array(items) => {
            let fields = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{fields}]")
        }
        other => other.to_string(),
    }
}

pub struct MessageSigner {
    secret: String,
    key: OnceLock<Vec<u8>>,
    send_seq: AtomicU64,
    last_recv_seq: Mutex<Option<u64>>,
}

impl MessageSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            key: OnceLock::new(),
            send_seq: AtomicU64::new(0),
            last_recv_seq: Mutex::new(None),
        }
    }

    /// Derive the signing key from the shared secret. Idempotent; `sign` and
    /// `verify` call it on demand.
    pub fn init(&self) {
        self.key
            .get_or_init(|| Sha256::digest(self.secret.as_bytes()).to_vec());
    }

    fn key(&self) -> &[u8] {
        self.init();
        self.key.get().map(Vec::as_slice).unwrap_or_default()
    }

    fn tag(&self, canonical: &str) -> anyhow::Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.key())
            .map_err(|_| anyhow::anyhow!("invalid hmac key length"))?;
        mac.update(canonical.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Stamp a JSON-RPC message with `_seq` and `_hmac`.
    pub fn sign(&self, message: &Value) -> anyhow::Result<Value> {
        let Value::Object(map) = message else {
            anyhow::bail!("only object messages can be signed");
        };

        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        let mut out = map.clone();
        out.insert("_seq".to_string(), Value::from(seq));

        let tag = self.tag(&canonical_json(&Value::Object(out.clone())))?;
        out.insert("_hmac".to_string(), Value::from(bytes_to_hex(&tag)));
        Ok(Value::Object(out))
    }

    /// Verify a stamped message, enforce sequence monotonicity, and return the
    /// original message with `_hmac` and `_seq` removed.
    pub fn verify(&self, message: &Value) -> anyhow::Result<Value> {
        let Value::Object(map) = message else {
            anyhow::bail!("only object messages can be verified");
        };

        let mut unsigned = map.clone();
        let given_hex = unsigned
            .remove("_hmac")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| anyhow::anyhow!("message has no _hmac"))?;
        let seq = unsigned
            .get("_seq")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow::anyhow!("message has no _seq"))?;

        let given = hex_to_bytes(&given_hex)?;
        let expected = self.tag(&canonical_json(&Value::Object(unsigned.clone())))?;
        if expected.ct_eq(&given).unwrap_u8() != 1 {
            anyhow::bail!("invalid message signature");
        }

        {
            let mut last = self.last_recv_seq.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = *last
                && seq <= prev
            {
                anyhow::bail!("Replay detected: sequence {seq} already accepted");
            }
            *last = Some(seq);
        }

        unsigned.remove("_seq");
        Ok(Value::Object(unsigned))
    }
}
