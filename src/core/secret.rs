//! Reversible obfuscation for the stored API key.
//!
//! This keeps the key from sitting in the settings file as plain text and
//! nothing more: the keystream comes from a host fingerprint anyone on the
//! same machine can recompute. Treat the stored value as sensitive.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

const PREFIX: &str = "obf1:";

#[derive(Clone)]
pub struct SecretCodec {
    key: [u8; 32],
}

impl SecretCodec {
    pub fn from_fingerprint(fingerprint: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(fingerprint.as_bytes()).into();
        Self { key }
    }

    pub fn for_this_device() -> Self {
        Self::from_fingerprint(&device_fingerprint())
    }

    pub fn obfuscate(&self, plain: &str) -> String {
        format!("{PREFIX}{}", STANDARD.encode(self.apply(plain.as_bytes())))
    }

    /// Inverse of [`obfuscate`](Self::obfuscate). Values that do not decode
    /// (other device, corrupted, never obfuscated) come back empty.
    pub fn reveal(&self, stored: &str) -> String {
        let Some(body) = stored.strip_prefix(PREFIX) else {
            return String::new();
        };
        STANDARD
            .decode(body)
            .ok()
            .and_then(|bytes| String::from_utf8(self.apply(&bytes)).ok())
            .unwrap_or_default()
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.chunks(32)
            .enumerate()
            .flat_map(|(block, chunk)| {
                let mut h = Sha256::new();
                h.update(self.key);
                h.update((block as u64).to_le_bytes());
                let pad = h.finalize();
                chunk.iter().zip(pad).map(|(b, p)| b ^ p).collect::<Vec<_>>()
            })
            .collect()
    }
}

fn device_fingerprint() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let home = dirs::home_dir().map(|p| p.display().to_string()).unwrap_or_default();
    format!("{host}|{user}|{home}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_long_values() {
        let codec = SecretCodec::from_fingerprint("host|me|/home/me");
        let key = "7~".repeat(50);
        let stored = codec.obfuscate(&key);
        assert!(stored.starts_with(PREFIX));
        assert!(!stored.contains(&key));
        assert_eq!(codec.reveal(&stored), key);
    }

    #[test]
    fn other_fingerprint_or_garbage_reveals_nothing_useful() {
        let a = SecretCodec::from_fingerprint("a");
        let b = SecretCodec::from_fingerprint("b");
        let stored = a.obfuscate("token-123");
        assert_ne!(b.reveal(&stored), "token-123");
        assert_eq!(a.reveal("plain-value"), "");
        assert_eq!(a.reveal("obf1:%%%"), "");
    }
}
