//! Node and stream identifiers, link keypairs, session keys and datagram
//! encryption.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::status::Status;

/// Opaque 64-bit mesh participant id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Fresh id from the given random source. Callers pass `OsRng` in
    /// production and a seeded rng in tests.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        NodeId(rng.next_u64())
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:016x}]", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Stream id, scoped to one (local node, peer node) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl StreamId {
    /// The per-peer control stream.
    pub const CONNECTION: StreamId = StreamId(0);

    /// The `n`th (1-based) fork id allocated by `local` towards `peer`. The
    /// lower node id owns odd ids, the higher one even ids.
    pub fn for_fork(local: NodeId, peer: NodeId, n: u64) -> StreamId {
        let parity = if local < peer { 1 } else { 0 };
        StreamId(2 * n + parity)
    }

    /// Whether `owner` allocates this id on its link with `other`.
    pub fn allocated_by(&self, owner: NodeId, other: NodeId) -> bool {
        let parity = if owner < other { 1 } else { 0 };
        self.0 != 0 && self.0 % 2 == parity
    }

    pub fn is_connection(&self) -> bool {
        *self == StreamId::CONNECTION
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Link public key (32 bytes, X25519).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

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

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// X25519 keypair used by packet links. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_rng(&mut OsRng)
    }

    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Derive the 32-byte session key for a link. Both node ids are mixed in
/// (lower first) so a key is bound to the pair that negotiated it.
pub fn derive_session_key(shared_secret: &[u8; 32], a: NodeId, b: NodeId) -> [u8; 32] {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(b"overnet-link-v1");
    hasher.update(shared_secret);
    hasher.update(lo.0.to_le_bytes());
    hasher.update(hi.0.to_le_bytes());
    hasher.finalize().into()
}

/// Direction bit folded into the nonce so the two ends of a link never use
/// the same nonce under the shared key.
pub fn direction_bit(sender: NodeId, receiver: NodeId) -> u8 {
    u8::from(sender > receiver)
}

fn nonce_bytes(direction: u8, nonce: u64) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0] = direction;
    out[4..12].copy_from_slice(&nonce.to_le_bytes());
    out
}

/// ChaCha20-Poly1305 seal. `nonce` must never repeat for a key and direction.
pub fn encrypt_wire(
    key: &[u8; 32],
    direction: u8,
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::Key)?;
    let nonce_bytes = nonce_bytes(direction, nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .encrypt(nonce_arr, plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

pub fn decrypt_wire(
    key: &[u8; 32],
    direction: u8,
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| CryptoError::Key)?;
    let nonce_bytes = nonce_bytes(direction, nonce);
    let nonce_arr = chacha20poly1305::aead::Nonce::<chacha20poly1305::ChaCha20Poly1305>::from_slice(
        &nonce_bytes,
    );
    cipher
        .decrypt(nonce_arr, ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

impl From<CryptoError> for Status {
    fn from(e: CryptoError) -> Self {
        Status::new(crate::status::StatusCode::DataLoss, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn node_ids_follow_injected_rng() {
        let a = NodeId::random(&mut StdRng::seed_from_u64(7));
        let b = NodeId::random(&mut StdRng::seed_from_u64(7));
        let c = NodeId::random(&mut StdRng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(NodeId(0xab).to_string(), "[00000000000000ab]");
    }

    #[test]
    fn fork_ids_never_collide() {
        let lo = NodeId(1);
        let hi = NodeId(2);
        for n in 1..50 {
            let a = StreamId::for_fork(lo, hi, n);
            let b = StreamId::for_fork(hi, lo, n);
            assert_ne!(a, b);
            assert!(a.allocated_by(lo, hi));
            assert!(!a.allocated_by(hi, lo));
            assert!(b.allocated_by(hi, lo));
            assert!(!a.is_connection() && !b.is_connection());
        }
        assert!(!StreamId::CONNECTION.allocated_by(hi, lo));
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let ka = derive_session_key(&a.shared_secret(b.public_key()), NodeId(1), NodeId(2));
        let kb = derive_session_key(&b.shared_secret(a.public_key()), NodeId(2), NodeId(1));
        assert_eq!(ka, kb);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let plain = b"hello overnet";
        let dir = direction_bit(NodeId(5), NodeId(3));
        let cipher = encrypt_wire(&key, dir, 9, plain).unwrap();
        let dec = decrypt_wire(&key, dir, 9, &cipher).unwrap();
        assert_eq!(dec.as_slice(), plain);
        assert!(decrypt_wire(&key, 1 - dir, 9, &cipher).is_err());
        assert!(decrypt_wire(&key, dir, 10, &cipher).is_err());
    }
}
