//! Incoming package checks that run before anything is applied.
//!
//! The checks are split by what they need: the file name and current node
//! (addressing), the decoded marker (marker/name agreement) and the sender's
//! counters (sequencing). The replay engine runs them in that order.

use crate::error::ValidationError;
use crate::node::Node;
use crate::package::{Marker, PackageKind, PackageName, PACKAGE_VERSION};
use crate::types::NodeId;

/// Addressing and payload checks that only need the file name.
///
/// `sender_known` is whether a node record exists for the sender.
pub fn validate_addressing(
    name: &PackageName,
    current: &NodeId,
    sender_known: bool,
    allow_anonymous: bool,
    payload: &[u8],
) -> Result<(), ValidationError> {
    // 1. Sender
    if !sender_known && !allow_anonymous {
        return Err(ValidationError::UnknownSender(name.sender.clone()));
    }

    // 2. Recipient
    if !name.recipient.includes(current) {
        return Err(ValidationError::WrongRecipient {
            recipient: name.recipient.to_string(),
            current: current.clone(),
        });
    }

    // 3. Never replay our own output
    if &name.sender == current {
        return Err(ValidationError::OwnPackage(current.clone()));
    }

    // 4. Payload
    if payload.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }

    Ok(())
}

/// The embedded marker must describe the same package as the file name.
pub fn validate_marker(name: &PackageName, marker: &Marker) -> Result<(), ValidationError> {
    if marker.version != PACKAGE_VERSION {
        return Err(ValidationError::Malformed(format!(
            "unsupported marker version {}",
            marker.version
        )));
    }
    if marker.application != name.application {
        return Err(mismatch("application", &marker.application, &name.application));
    }
    if marker.sender != name.sender {
        return Err(mismatch("sender", &marker.sender, &name.sender));
    }
    if marker.recipient != name.recipient {
        return Err(mismatch("recipient", &marker.recipient, &name.recipient));
    }
    if marker.seq != name.seq {
        return Err(mismatch("sequence", &marker.seq, &name.seq));
    }
    if marker.kind != name.kind {
        return Err(ValidationError::KindMismatch {
            expected: name.kind,
            got: marker.kind,
        });
    }
    Ok(())
}

fn mismatch(
    field: &'static str,
    marker: &impl std::fmt::Display,
    file: &impl std::fmt::Display,
) -> ValidationError {
    ValidationError::MarkerMismatch {
        field,
        marker: marker.to_string(),
        file: file.to_string(),
    }
}

/// Outcome of the sequence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Apply the package.
    Apply,
    /// Protocol package older than the bootstrap snapshot: succeed without
    /// applying anything.
    CoveredBySnapshot,
}

/// Sequence rules.
///
/// Protocol packages must carry exactly `sender.last_loaded_seq + 1`, unless
/// their date precedes a snapshot loaded from the same sender. Snapshots only
/// have to be newer than the last loaded snapshot, since they reset the
/// protocol counter themselves.
pub fn check_sequence(marker: &Marker, sender: &Node) -> Result<SequenceCheck, ValidationError> {
    match marker.kind {
        PackageKind::Protocol => {
            if sender.predates_bootstrap(marker.created_at) {
                return Ok(SequenceCheck::CoveredBySnapshot);
            }
            let expected = sender.expected_loaded_seq();
            if marker.seq != expected {
                return Err(ValidationError::InvalidSequence {
                    expected,
                    got: marker.seq,
                });
            }
            Ok(SequenceCheck::Apply)
        }
        PackageKind::Snapshot => {
            if marker.seq <= sender.last_loaded_snapshot_seq {
                return Err(ValidationError::StaleSnapshot {
                    last: sender.last_loaded_snapshot_seq,
                    got: marker.seq,
                });
            }
            Ok(SequenceCheck::Apply)
        }
    }
}
