//! # Courier Core
//!
//! Pure data for the Courier replication engine: node records, the change
//! log, the object graph model, transport units and their wire format.
//!
//! This crate contains no storage and no networking.
//!
//! ## Key Types
//!
//! - [`Node`] - A peer and its per-direction sequence counters
//! - [`ChangeSession`] / [`ChangeRecord`] - Captured local mutations
//! - [`Object`] / [`Schema`] - The replicated object graph and its classes
//! - [`PackageName`] / [`Marker`] - External and embedded identity of a package
//! - [`Ticket`] - Delivery-status notice travelling back to a sender
//!
//! ## Wire format
//!
//! Packages are a header followed by CBOR entries. See [`canonical`] module.

pub mod canonical;
pub mod change;
pub mod error;
pub mod node;
pub mod object;
pub mod package;
pub mod selector;
pub mod types;
pub mod validation;

pub use canonical::{decode_package, encode_package, peek_marker, PackageReader};
pub use change::{ChangeKind, ChangeRecord, ChangeSession, ChangeValue, ObjectRef, Route};
pub use error::{CoreError, ValidationError};
pub use node::Node;
pub use object::{
    ClassInfo, FieldValue, MethodInfo, NaturalKey, Object, PropertyInfo, PropertyKind, Scalar,
    ScalarType, Schema,
};
pub use package::{
    Entry, KnownMapping, Marker, Package, PackageBody, PackageKind, PackageName, PackagedRecord,
    PackagedRef, PackagedSession, PackagedValue, Recipient, SealedPackage, SessionHeader,
    SnapshotField, SnapshotIdentity, SnapshotObject, Ticket, TicketEvent, ALL_NODES,
    PACKAGE_VERSION,
};
pub use selector::{
    ClassSelector, FilterMode, Predicate, Selector, SelectorConfig, SelectorContext, SelectorRule,
};
pub use types::{now_millis, NodeId, ObjectKey, SessionId};
pub use validation::{check_sequence, validate_addressing, validate_marker, SequenceCheck};
