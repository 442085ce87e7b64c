//! Package wire format.
//!
//! ```text
//! "CPKG" | version: u8 | CBOR Marker | CBOR Entry * marker.entry_count
//! ```
//!
//! The marker carries a Blake3 digest of the encoded entries, so a reader can
//! stream entries one at a time and still verify the payload at the end.

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::{CoreError, Result, ValidationError};
use crate::package::{
    Entry, Marker, Package, PackageBody, PackageKind, PackagedSession, Ticket, PACKAGE_VERSION,
};

/// Leading bytes of every package.
pub const MAGIC: &[u8; 4] = b"CPKG";

/// Append one CBOR-encoded entry to `out`.
pub fn encode_entry<W: Write>(entry: &Entry, out: &mut W) -> Result<()> {
    ciborium::into_writer(entry, out).map_err(|e| CoreError::EncodingError(e.to_string()))
}

/// Digest of an encoded entry stream.
pub fn digest_entries(entries: &[u8]) -> [u8; 32] {
    *blake3::hash(entries).as_bytes()
}

/// Write a complete package. `marker.digest` and `marker.entry_count` must
/// already describe `entries`.
pub fn write_package<W: Write>(out: &mut W, marker: &Marker, entries: &[u8]) -> Result<()> {
    out.write_all(MAGIC)
        .and_then(|_| out.write_all(&[PACKAGE_VERSION]))
        .map_err(|e| CoreError::EncodingError(e.to_string()))?;
    ciborium::into_writer(marker, &mut *out).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    out.write_all(entries)
        .map_err(|e| CoreError::EncodingError(e.to_string()))
}

/// Encode a whole in-memory package. The marker's digest and entry count
/// are recomputed.
pub fn encode_package(package: &Package) -> Result<Vec<u8>> {
    let mut entries = Vec::new();
    let mut count = 0u64;
    match &package.body {
        PackageBody::Protocol { sessions } => {
            for session in sessions {
                encode_entry(&Entry::Session(session.header.clone()), &mut entries)?;
                count += 1;
                for record in &session.records {
                    encode_entry(
                        &Entry::Record {
                            session: session.header.id,
                            record: record.clone(),
                        },
                        &mut entries,
                    )?;
                    count += 1;
                }
            }
        }
        PackageBody::Snapshot {
            objects,
            identities,
        } => {
            for object in objects {
                encode_entry(&Entry::Object(object.clone()), &mut entries)?;
                count += 1;
            }
            for identity in identities {
                encode_entry(&Entry::Identity(identity.clone()), &mut entries)?;
                count += 1;
            }
        }
    }

    let mut marker = package.marker.clone();
    marker.entry_count = count;
    marker.digest = digest_entries(&entries);

    let mut out = Vec::with_capacity(entries.len() + 128);
    write_package(&mut out, &marker, &entries)?;
    Ok(out)
}

/// Reader adapter that hashes every byte it yields.
struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Streaming package decoder.
pub struct PackageReader<R: Read> {
    marker: Marker,
    reader: HashingReader<R>,
    remaining: u64,
}

impl<R: Read> PackageReader<R> {
    /// Read and check the header and marker.
    pub fn new(mut reader: R) -> std::result::Result<Self, ValidationError> {
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| ValidationError::Malformed("truncated header".into()))?;
        if &magic != MAGIC {
            return Err(CoreError::BadMagic.into());
        }
        let mut version = [0u8; 1];
        reader
            .read_exact(&mut version)
            .map_err(|_| ValidationError::Malformed("truncated header".into()))?;
        if version[0] != PACKAGE_VERSION {
            return Err(CoreError::UnsupportedVersion(version[0]).into());
        }
        let marker: Marker = ciborium::from_reader(&mut reader)
            .map_err(|e| ValidationError::Malformed(format!("marker: {e}")))?;
        Ok(Self {
            remaining: marker.entry_count,
            marker,
            reader: HashingReader {
                inner: reader,
                hasher: blake3::Hasher::new(),
            },
        })
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    /// Next entry, or `None` once `entry_count` entries were read.
    pub fn next_entry(&mut self) -> std::result::Result<Option<Entry>, ValidationError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let entry: Entry = ciborium::from_reader(&mut self.reader)
            .map_err(|e| ValidationError::Malformed(format!("entry: {e}")))?;
        self.remaining -= 1;
        Ok(Some(entry))
    }

    /// Check the digest and that nothing follows the last entry.
    pub fn finish(mut self) -> std::result::Result<Marker, ValidationError> {
        while self.next_entry()?.is_some() {}
        let mut trailing = [0u8; 1];
        match self.reader.inner.read(&mut trailing) {
            Ok(0) => {}
            Ok(_) => return Err(ValidationError::Malformed("trailing bytes".into())),
            Err(e) => return Err(ValidationError::Malformed(e.to_string())),
        }
        if *self.reader.hasher.finalize().as_bytes() != self.marker.digest {
            return Err(ValidationError::DigestMismatch);
        }
        Ok(self.marker)
    }
}

/// Read only the marker of an encoded package.
pub fn peek_marker(bytes: &[u8]) -> std::result::Result<Marker, ValidationError> {
    Ok(PackageReader::new(bytes)?.marker)
}

/// Decode and verify a whole package.
pub fn decode_package(bytes: &[u8]) -> std::result::Result<Package, ValidationError> {
    let mut reader = PackageReader::new(bytes)?;
    let kind = reader.marker().kind;

    let mut sessions: Vec<PackagedSession> = Vec::new();
    let mut index = HashMap::new();
    let mut objects = Vec::new();
    let mut identities = Vec::new();

    while let Some(entry) = reader.next_entry()? {
        match (kind, entry) {
            (PackageKind::Protocol, Entry::Session(header)) => {
                if index.insert(header.id, sessions.len()).is_some() {
                    return Err(ValidationError::Malformed(format!(
                        "duplicate session {}",
                        header.id
                    )));
                }
                sessions.push(PackagedSession {
                    header,
                    records: Vec::new(),
                });
            }
            (PackageKind::Protocol, Entry::Record { session, record }) => {
                let Some(&i) = index.get(&session) else {
                    return Err(ValidationError::Malformed(format!(
                        "record for unknown session {session}"
                    )));
                };
                sessions[i].records.push(record);
            }
            (PackageKind::Snapshot, Entry::Object(object)) => objects.push(object),
            (PackageKind::Snapshot, Entry::Identity(identity)) => identities.push(identity),
            (kind, entry) => {
                return Err(ValidationError::Malformed(format!(
                    "unexpected {} entry in {kind} package",
                    entry_name(&entry)
                )))
            }
        }
    }

    let marker = reader.finish()?;
    let body = match kind {
        PackageKind::Protocol => PackageBody::Protocol { sessions },
        PackageKind::Snapshot => PackageBody::Snapshot {
            objects,
            identities,
        },
    };
    Ok(Package { marker, body })
}

fn entry_name(entry: &Entry) -> &'static str {
    match entry {
        Entry::Session(_) => "session",
        Entry::Record { .. } => "record",
        Entry::Object(_) => "object",
        Entry::Identity(_) => "identity",
    }
}

/// Encode a ticket.
pub fn encode_ticket(ticket: &Ticket) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(ticket, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    Ok(buf)
}

/// Decode a ticket.
pub fn decode_ticket(bytes: &[u8]) -> Result<Ticket> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
}
