//! # Courier Seal
//!
//! The pack/unpack collaborator: every outbound package and ticket payload is
//! packed for its channel and every inbound one is unpacked before decoding.
//!
//! ## Encryption Model
//!
//! 1. **Peer channel**: a ChaCha20-Poly1305 key derived with Blake3 from the
//!    X25519 shared secret of the two nodes
//! 2. **Broadcast channel**: a network key distributed out of band
//!
//! Payloads are zstd-compressed before encryption. [`PlainPacker`] skips both
//! stages for deployments whose transport already protects the data.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::NodeId;
//! use courier_seal::{Channel, Keyring, Packer, SealedPacker, X25519StaticSecret};
//!
//! let peer = X25519StaticSecret::generate();
//! let keyring = Keyring::new(NodeId::new("A"), X25519StaticSecret::generate())
//!     .with_peer(NodeId::new("B"), peer.public_key());
//! let packer = SealedPacker::new(keyring);
//! let sealed = packer.pack(b"package".to_vec(), &Channel::Peer(NodeId::new("B"))).unwrap();
//! ```

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keyring;
pub mod packer;

pub use crypto::{EncryptionKey, EncryptionNonce, SharedKey, X25519PublicKey, X25519StaticSecret};
pub use envelope::{SealFormat, SealedEnvelope};
pub use error::{Result, SealError};
pub use keyring::{Channel, Keyring};
pub use packer::{Packer, PlainPacker, SealedPacker, Stage, StageHook};
