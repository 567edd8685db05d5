//! Device identity and crypto: keypairs, device ID, peer nodes, handshake, session keys, wire sealing.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::protocol::PROTOCOL_VERSION;

/// Device public key (32 bytes, X25519).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] pub [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Device ID: deterministic hash of public key. Identifies a peer node on the channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceId(#[serde(with = "bytes_16")] pub [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl DeviceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive device ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A reachable device on the peer channel: identifier plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub id: DeviceId,
    pub display_name: String,
}

impl PeerNode {
    pub fn new(id: DeviceId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and device ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    /// Generate a new random keypair and derive device ID from public key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        let device_id = DeviceId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            device_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Shared secret with another device's public key. Used to derive session key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Session key for one connection to `other_public`. Both handshake salts go in,
    /// so every connection between the same pair gets a fresh key.
    pub fn session_key(&self, other_public: &PublicKey, ours: &Salt, theirs: &Salt) -> [u8; 32] {
        derive_session_key(&self.shared_secret(other_public), ours, theirs)
    }
}

/// Per-connection random value carried in the handshake.
pub type Salt = [u8; SALT_LEN];

pub const SALT_LEN: usize = 16;

/// Derive a 32-byte session key (ChaCha20-Poly1305 key) from the shared secret and
/// both salts. Salt order does not matter, so each end may pass its own first.
pub fn derive_session_key(shared_secret: &[u8; 32], a: &Salt, b: &Salt) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(b"wearmaps-session-v1");
    hasher.update(shared_secret);
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

/// Fixed part of the handshake: version + device_id + public_key + salt + name length.
pub const HANDSHAKE_FIXED_SIZE: usize = 1 + 16 + 32 + SALT_LEN + 1;

/// Longest display name carried in a handshake, in bytes.
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Channel handshake, sent by both sides right after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub salt: Salt,
    pub display_name: String,
}

/// Handshake header as read off the wire, before the display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub salt: Salt,
    pub name_len: usize,
}

impl Handshake {
    /// Our side of a new connection, with a fresh random salt.
    pub fn for_keypair(keypair: &Keypair, display_name: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self {
            device_id: keypair.device_id(),
            public_key: keypair.public_key().clone(),
            salt,
            display_name: truncate_name(display_name).to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let name = truncate_name(&self.display_name).as_bytes();
        let mut out = Vec::with_capacity(HANDSHAKE_FIXED_SIZE + name.len());
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(self.device_id.as_bytes());
        out.extend_from_slice(self.public_key.as_bytes());
        out.extend_from_slice(&self.salt);
        out.push(name.len() as u8);
        out.extend_from_slice(name);
        out
    }

    /// Parse the fixed header. Returns the name length still to be read.
    pub fn parse_fixed(buf: &[u8; HANDSHAKE_FIXED_SIZE]) -> Result<HandshakeHeader, HandshakeError> {
        if buf[0] != PROTOCOL_VERSION {
            return Err(HandshakeError::Version(buf[0]));
        }
        let mut device_id = [0u8; 16];
        device_id.copy_from_slice(&buf[1..17]);
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&buf[17..49]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[49..49 + SALT_LEN]);
        let name_len = buf[49 + SALT_LEN] as usize;
        if name_len > MAX_DISPLAY_NAME_LEN {
            return Err(HandshakeError::NameTooLong(name_len));
        }
        let public_key = PublicKey(public_key);
        let device_id = DeviceId(device_id);
        if DeviceId::from_public_key(public_key.as_bytes()) != device_id {
            return Err(HandshakeError::IdMismatch);
        }
        Ok(HandshakeHeader {
            device_id,
            public_key,
            salt,
            name_len,
        })
    }

    pub fn from_parts(header: HandshakeHeader, name: &[u8]) -> Result<Self, HandshakeError> {
        let display_name = std::str::from_utf8(name)
            .map_err(|_| HandshakeError::NameEncoding)?
            .to_string();
        Ok(Self {
            device_id: header.device_id,
            public_key: header.public_key,
            salt: header.salt,
            display_name,
        })
    }

    pub fn peer_node(&self) -> PeerNode {
        PeerNode::new(self.device_id, self.display_name.clone())
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_DISPLAY_NAME_LEN {
        return name;
    }
    let mut end = MAX_DISPLAY_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("display name too long ({0} bytes)")]
    NameTooLong(usize),
    #[error("display name is not utf-8")]
    NameEncoding,
    #[error("device id does not match public key")]
    IdMismatch,
}

fn nonce_for(nonce: u64) -> [u8; 12] {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&nonce.to_le_bytes());
    nonce_bytes
}

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_for(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    let nonce_bytes = nonce_for(nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_device_id_derivation() {
        let kp = Keypair::generate();
        let id = DeviceId::from_public_key(kp.public_key().as_bytes());
        assert_eq!(id, kp.device_id());
    }

    #[test]
    fn both_sides_derive_same_session_key() {
        let phone = Keypair::generate();
        let watch = Keypair::generate();
        let (p, w) = (
            Handshake::for_keypair(&phone, "phone"),
            Handshake::for_keypair(&watch, "watch"),
        );
        assert_eq!(
            phone.session_key(watch.public_key(), &p.salt, &w.salt),
            watch.session_key(phone.public_key(), &w.salt, &p.salt)
        );
    }

    #[test]
    fn reconnecting_pair_gets_a_fresh_session_key() {
        let phone = Keypair::generate();
        let watch = Keypair::generate();
        let first = (
            Handshake::for_keypair(&phone, "phone").salt,
            Handshake::for_keypair(&watch, "watch").salt,
        );
        let second = (
            Handshake::for_keypair(&phone, "phone").salt,
            Handshake::for_keypair(&watch, "watch").salt,
        );
        assert_ne!(first, second);
        assert_ne!(
            phone.session_key(watch.public_key(), &first.0, &first.1),
            phone.session_key(watch.public_key(), &second.0, &second.1)
        );
    }

    #[test]
    fn sealed_frame_opens_only_with_matching_nonce() {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let sealed = encrypt_wire(&key, 7, b"location 1.000000 2.000000").unwrap();
        let opened = decrypt_wire(&key, 7, &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"location 1.000000 2.000000");
        assert!(decrypt_wire(&key, 8, &sealed).is_err());
    }

    #[test]
    fn device_id_displays_as_hex() {
        let id = DeviceId([0xab; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
    }

    #[test]
    fn handshake_fixed_header_parses() {
        let kp = Keypair::generate();
        let hs = Handshake::for_keypair(&kp, "Pixel Watch");
        let bytes = hs.to_bytes();
        let mut fixed = [0u8; HANDSHAKE_FIXED_SIZE];
        fixed.copy_from_slice(&bytes[..HANDSHAKE_FIXED_SIZE]);
        let header = Handshake::parse_fixed(&fixed).unwrap();
        assert_eq!(header.device_id, kp.device_id());
        assert_eq!(header.salt, hs.salt);
        assert_eq!(header.name_len, "Pixel Watch".len());
        let parsed = Handshake::from_parts(header, &bytes[HANDSHAKE_FIXED_SIZE..]).unwrap();
        assert_eq!(parsed, hs);
        assert_eq!(parsed.peer_node().display_name, "Pixel Watch");
    }

    #[test]
    fn handshake_rejects_forged_device_id() {
        let kp = Keypair::generate();
        let mut bytes = Handshake::for_keypair(&kp, "watch").to_bytes();
        bytes[1] ^= 0xff;
        let mut fixed = [0u8; HANDSHAKE_FIXED_SIZE];
        fixed.copy_from_slice(&bytes[..HANDSHAKE_FIXED_SIZE]);
        assert!(matches!(
            Handshake::parse_fixed(&fixed),
            Err(HandshakeError::IdMismatch)
        ));
    }

    #[test]
    fn long_display_names_are_truncated_on_char_boundary() {
        let kp = Keypair::generate();
        let name = "é".repeat(40);
        let hs = Handshake::for_keypair(&kp, &name);
        assert!(hs.display_name.len() <= MAX_DISPLAY_NAME_LEN);
        assert!(hs.display_name.chars().all(|c| c == 'é'));
    }
}
