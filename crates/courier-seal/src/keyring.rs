//! Per-peer package keys.
//!
//! Point-to-point packages and tickets are encrypted with a key both ends
//! derive from X25519 key agreement. Packages addressed to all nodes use a
//! network key shared out of band.

use std::collections::HashMap;

use courier_core::NodeId;

use crate::crypto::{EncryptionKey, X25519PublicKey, X25519StaticSecret};
use crate::error::{Result, SealError};

/// Which key a payload is sealed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Between the local node and one peer, in either direction.
    Peer(NodeId),
    /// A package addressed to all nodes.
    Broadcast,
}

/// Key material of the local node.
pub struct Keyring {
    local: NodeId,
    secret: X25519StaticSecret,
    peers: HashMap<NodeId, X25519PublicKey>,
    network_key: Option<EncryptionKey>,
}

impl Keyring {
    pub fn new(local: NodeId, secret: X25519StaticSecret) -> Self {
        Self {
            local,
            secret,
            peers: HashMap::new(),
            network_key: None,
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn public_key(&self) -> X25519PublicKey {
        self.secret.public_key()
    }

    /// Register a peer's public key.
    pub fn add_peer(&mut self, peer: NodeId, public: X25519PublicKey) {
        self.peers.insert(peer, public);
    }

    pub fn with_peer(mut self, peer: NodeId, public: X25519PublicKey) -> Self {
        self.add_peer(peer, public);
        self
    }

    pub fn with_network_key(mut self, key: EncryptionKey) -> Self {
        self.network_key = Some(key);
        self
    }

    /// The key for `channel`.
    pub fn key_for(&self, channel: &Channel) -> Result<EncryptionKey> {
        match channel {
            Channel::Peer(peer) => {
                let public = self
                    .peers
                    .get(peer)
                    .ok_or_else(|| SealError::UnknownPeer(peer.clone()))?;
                let shared = self.secret.diffie_hellman(public);
                Ok(shared.derive_package_key(&pair_context(&self.local, peer)))
            }
            Channel::Broadcast => self.network_key.clone().ok_or(SealError::NoNetworkKey),
        }
    }
}

/// Both ends must derive the same context, so the pair is ordered.
fn pair_context(a: &NodeId, b: &NodeId) -> Vec<u8> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}|{hi}").into_bytes()
}
