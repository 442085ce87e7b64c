//! The pack/unpack pipeline applied around every outbound and inbound
//! package and ticket payload.
//!
//! Packing compresses then encrypts; unpacking reverses it. A [`StageHook`]
//! may inspect or replace the bytes before and after each stage.

use std::sync::Arc;

use crate::envelope::SealedEnvelope;
use crate::error::{Result, SealError};
use crate::keyring::{Channel, Keyring};

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compress,
    Encrypt,
    Decrypt,
    Decompress,
}

/// Hook around each stage. Both methods default to passing bytes through.
pub trait StageHook: Send + Sync {
    fn before(&self, _stage: Stage, _channel: &Channel, bytes: Vec<u8>) -> Result<Vec<u8>> {
        Ok(bytes)
    }

    fn after(&self, _stage: Stage, _channel: &Channel, bytes: Vec<u8>) -> Result<Vec<u8>> {
        Ok(bytes)
    }
}

/// The pack/unpack collaborator.
pub trait Packer: Send + Sync {
    fn pack(&self, bytes: Vec<u8>, channel: &Channel) -> Result<Vec<u8>>;

    fn unpack(&self, bytes: Vec<u8>, channel: &Channel) -> Result<Vec<u8>>;
}

/// Passes bytes through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainPacker;

impl Packer for PlainPacker {
    fn pack(&self, bytes: Vec<u8>, _channel: &Channel) -> Result<Vec<u8>> {
        Ok(bytes)
    }

    fn unpack(&self, bytes: Vec<u8>, _channel: &Channel) -> Result<Vec<u8>> {
        Ok(bytes)
    }
}

/// zstd compression followed by ChaCha20-Poly1305 under the channel key.
pub struct SealedPacker {
    keyring: Keyring,
    level: i32,
    hooks: Vec<Arc<dyn StageHook>>,
}

impl SealedPacker {
    pub fn new(keyring: Keyring) -> Self {
        Self {
            keyring,
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
            hooks: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn StageHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    fn run<F>(&self, stage: Stage, channel: &Channel, bytes: Vec<u8>, f: F) -> Result<Vec<u8>>
    where
        F: FnOnce(Vec<u8>) -> Result<Vec<u8>>,
    {
        let mut bytes = bytes;
        for hook in &self.hooks {
            bytes = hook.before(stage, channel, bytes)?;
        }
        bytes = f(bytes)?;
        for hook in &self.hooks {
            bytes = hook.after(stage, channel, bytes)?;
        }
        Ok(bytes)
    }
}

impl Packer for SealedPacker {
    fn pack(&self, bytes: Vec<u8>, channel: &Channel) -> Result<Vec<u8>> {
        let key = self.keyring.key_for(channel)?;
        let compressed = self.run(Stage::Compress, channel, bytes, |b| {
            zstd::encode_all(b.as_slice(), self.level)
                .map_err(|e| SealError::CompressionError(e.to_string()))
        })?;
        self.run(Stage::Encrypt, channel, compressed, |b| {
            SealedEnvelope::seal(&b, &key)?.to_bytes()
        })
    }

    fn unpack(&self, bytes: Vec<u8>, channel: &Channel) -> Result<Vec<u8>> {
        let key = self.keyring.key_for(channel)?;
        let compressed = self.run(Stage::Decrypt, channel, bytes, |b| {
            SealedEnvelope::from_bytes(&b)?.open(&key)
        })?;
        self.run(Stage::Decompress, channel, compressed, |b| {
            zstd::decode_all(b.as_slice()).map_err(|e| SealError::CompressionError(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionKey, X25519StaticSecret};
    use courier_core::NodeId;
    use std::sync::Mutex;

    fn pair() -> (SealedPacker, SealedPacker) {
        let a_secret = X25519StaticSecret::generate();
        let b_secret = X25519StaticSecret::generate();
        let (a_pub, b_pub) = (a_secret.public_key(), b_secret.public_key());
        let network = EncryptionKey::from_bytes([7; 32]);
        let a = Keyring::new(NodeId::new("A"), a_secret)
            .with_peer(NodeId::new("B"), b_pub)
            .with_network_key(network.clone());
        let b = Keyring::new(NodeId::new("B"), b_secret)
            .with_peer(NodeId::new("A"), a_pub)
            .with_network_key(network);
        (SealedPacker::new(a), SealedPacker::new(b))
    }

    #[test]
    fn test_peer_pack_unpack() {
        let (a, b) = pair();
        let payload = b"CPKG payload ".repeat(100);
        let packed = a
            .pack(payload.clone(), &Channel::Peer(NodeId::new("B")))
            .unwrap();
        assert!(packed.len() < payload.len());
        let unpacked = b.unpack(packed, &Channel::Peer(NodeId::new("A"))).unwrap();
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn test_broadcast_uses_network_key() {
        let (a, b) = pair();
        let packed = a.pack(b"hello".to_vec(), &Channel::Broadcast).unwrap();
        assert_eq!(b.unpack(packed, &Channel::Broadcast).unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_channel_fails() {
        let (a, b) = pair();
        let packed = a.pack(b"hello".to_vec(), &Channel::Broadcast).unwrap();
        assert!(b.unpack(packed, &Channel::Peer(NodeId::new("A"))).is_err());
    }

    struct Recorder(Mutex<Vec<(bool, Stage)>>);

    impl StageHook for Recorder {
        fn before(&self, stage: Stage, _: &Channel, bytes: Vec<u8>) -> Result<Vec<u8>> {
            self.0.lock().unwrap().push((true, stage));
            Ok(bytes)
        }

        fn after(&self, stage: Stage, _: &Channel, bytes: Vec<u8>) -> Result<Vec<u8>> {
            self.0.lock().unwrap().push((false, stage));
            Ok(bytes)
        }
    }

    #[test]
    fn test_hooks_wrap_each_stage() {
        let (a, _) = pair();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let a = a.with_hook(recorder.clone());
        a.pack(b"x".to_vec(), &Channel::Broadcast).unwrap();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                (true, Stage::Compress),
                (false, Stage::Compress),
                (true, Stage::Encrypt),
                (false, Stage::Encrypt),
            ]
        );
    }

    #[test]
    fn test_plain_packer_is_identity() {
        let bytes = PlainPacker
            .pack(b"abc".to_vec(), &Channel::Broadcast)
            .unwrap();
        assert_eq!(bytes, b"abc");
    }
}
