//! Package building: turns routed sessions into one sealed package per
//! recipient and commits the result in a single batch.

use std::collections::{BTreeMap, HashMap, HashSet};

use courier_core::canonical::write_package;
use courier_core::{
    now_millis, ChangeRecord, ChangeValue, Entry, KnownMapping, Marker, Node, NodeId, ObjectKey,
    ObjectRef, PackageKind, PackageName, PackagedRecord, PackagedRef, PackagedValue, Recipient,
    SealedPackage, SessionHeader, SessionId, PACKAGE_VERSION,
};
use courier_seal::{Channel, Packer};
use courier_store::{
    LogEntry, PackageDirection, PackageEvent, Store, StoredPackage, WriteBatch,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::SpillBuffer;
use crate::config::{EngineConfig, RoutingMode};
use crate::error::{Result, SyncError};
use crate::progress::{emit, ProgressTx, Task};
use crate::router::{RoutePlan, Router};

/// Outcome of one build.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub packages: Vec<SealedPackage>,
    /// Sessions marked saved, pruned ones included.
    pub sessions_processed: usize,
    /// Records written across all packages.
    pub records_written: usize,
}

/// Identity-map breadcrumbs per local object, fetched once per build.
#[derive(Default)]
pub(crate) struct MappingCache {
    known: HashMap<ObjectKey, Vec<KnownMapping>>,
}

impl MappingCache {
    pub(crate) async fn known_mapping<S: Store + ?Sized>(
        &mut self,
        store: &S,
        key: &ObjectKey,
    ) -> Result<Vec<KnownMapping>> {
        if let Some(known) = self.known.get(key) {
            return Ok(known.clone());
        }
        let known: Vec<KnownMapping> = store
            .identities_for(key)
            .await?
            .into_iter()
            .map(|e| KnownMapping {
                node: e.peer,
                object_id: e.remote_id,
            })
            .collect();
        self.known.insert(key.clone(), known.clone());
        Ok(known)
    }

    async fn packaged_ref<S: Store + ?Sized>(
        &mut self,
        store: &S,
        reference: &ObjectRef,
    ) -> Result<PackagedRef> {
        Ok(PackagedRef {
            assembly: reference.assembly.clone(),
            class: reference.class.clone(),
            id: reference.id.clone(),
            replication_key: reference.replication_key.clone(),
            known_mapping: self.known_mapping(store, &reference.key()).await?,
        })
    }

    async fn packaged_value<S: Store + ?Sized>(
        &mut self,
        store: &S,
        value: &ChangeValue,
    ) -> Result<PackagedValue> {
        Ok(match value {
            ChangeValue::Null => PackagedValue::Null,
            ChangeValue::Scalar { text, raw } => PackagedValue::Scalar {
                text: text.clone(),
                raw: raw.clone(),
            },
            ChangeValue::Object(reference) => {
                PackagedValue::Object(self.packaged_ref(store, reference).await?)
            }
        })
    }

    async fn packaged_record<S: Store + ?Sized>(
        &mut self,
        store: &S,
        record: &ChangeRecord,
    ) -> Result<PackagedRecord> {
        let target = match &record.target {
            Some(target) => Some(self.packaged_ref(store, target).await?),
            None => None,
        };
        let mut arguments = Vec::with_capacity(record.arguments.len());
        for arg in &record.arguments {
            arguments.push(self.packaged_value(store, arg).await?);
        }
        Ok(PackagedRecord {
            kind: record.kind,
            target,
            property: record.property.clone(),
            old_value: self.packaged_value(store, &record.old_value).await?,
            new_value: self.packaged_value(store, &record.new_value).await?,
            arguments,
            modified_at: record.modified_at,
            user: record.user.clone(),
        })
    }
}

/// One package being filled for one recipient.
struct PackageWriter {
    node: Node,
    recipient: Recipient,
    seq: u64,
    entries: SpillBuffer,
    headers: HashSet<SessionId>,
    sessions: usize,
    records: usize,
}

impl PackageWriter {
    fn write_header(&mut self, header: SessionHeader) -> Result<()> {
        if self.headers.insert(header.id) {
            self.entries.push(&Entry::Session(header))?;
            self.sessions += 1;
        }
        Ok(())
    }

    fn write_record(&mut self, session: SessionId, record: PackagedRecord) -> Result<()> {
        self.entries.push(&Entry::Record { session, record })?;
        self.records += 1;
        Ok(())
    }
}

/// Turns routed sessions into one sealed package per recipient.
pub struct PackageBuilder<'a, S: Store + ?Sized> {
    store: &'a S,
    config: &'a EngineConfig,
    packer: &'a dyn Packer,
    router: Router<'a>,
}

impl<'a, S: Store + ?Sized> PackageBuilder<'a, S> {
    /// Builder over `store`, sealing with `packer`.
    pub fn new(
        store: &'a S,
        config: &'a EngineConfig,
        packer: &'a dyn Packer,
        router: Router<'a>,
    ) -> Self {
        Self {
            store,
            config,
            packer,
            router,
        }
    }

    /// Package every unsaved session for its recipients.
    ///
    /// Nothing is committed unless the whole build succeeds; cancellation
    /// leaves the change log and counters untouched.
    pub async fn build(
        &self,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<BuildReport> {
        // Phase 1: Gather
        let current = self
            .store
            .current_node()
            .await?
            .ok_or(SyncError::NotInitialized)?;
        let peers = self.store.list_nodes().await?;
        let unsaved = self.store.unsaved_sessions().await?;
        if unsaved.is_empty() {
            debug!("no unsaved sessions");
            return Ok(BuildReport::default());
        }

        // Phase 2: Route
        let plan = self
            .router
            .route(self.store, &current, &peers, unsaved)
            .await?;
        let nodes: HashMap<&NodeId, &Node> = peers.iter().map(|n| (&n.id, n)).collect();
        let receivers = subtree_receivers(&plan, &nodes);

        // Phase 3: Fill one package per recipient
        let parent_of: HashMap<SessionId, SessionId> = plan
            .sessions
            .iter()
            .filter_map(|s| s.session.parent.map(|p| (s.session.id, p)))
            .collect();
        let headers: HashMap<SessionId, SessionHeader> = plan
            .sessions
            .iter()
            .map(|s| {
                (
                    s.session.id,
                    SessionHeader {
                        id: s.session.id,
                        parent: s.session.parent,
                        committed_at: s.session.committed_at,
                        route: s.session.route.clone(),
                    },
                )
            })
            .collect();

        let mut writers: BTreeMap<NodeId, PackageWriter> = BTreeMap::new();
        let mut mappings = MappingCache::default();
        let total = plan.sessions.len();

        for (done, routed) in plan.sessions.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("build cancelled");
                return Err(SyncError::Cancelled);
            }
            let session_id = routed.session.id;
            let in_subtree = receivers.get(&session_id);

            for entry in &routed.records {
                let record = &entry.record;
                for recipient in &entry.recipients {
                    let Some(node) = nodes.get(recipient) else {
                        warn!(%recipient, "recipient has no node record, skipped");
                        continue;
                    };
                    if record.is_real() {
                        if node.covered_by_snapshot(record.modified_at) {
                            continue;
                        }
                    } else if !in_subtree.is_some_and(|r| r.contains(recipient)) {
                        continue;
                    }

                    let writer = writers
                        .entry(recipient.clone())
                        .or_insert_with(|| self.open_writer(&current, node));
                    for header in ancestry(session_id, &parent_of, &headers) {
                        writer.write_header(header)?;
                    }
                    let packaged = mappings.packaged_record(self.store, record).await?;
                    writer.write_record(session_id, packaged)?;
                }
            }
            emit(progress, Task::Build, done + 1, total, "routing sessions");
        }

        // Phase 4: Seal and commit
        let now = now_millis();
        let mut batch = WriteBatch::new();
        let mut report = BuildReport {
            sessions_processed: plan.processed.len(),
            ..BuildReport::default()
        };
        for (_, writer) in writers {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            report.records_written += writer.records;
            let sealed = self.seal(&current, writer, now, &mut batch)?;
            report.packages.push(sealed);
        }
        batch.sessions_saved = plan.processed;
        self.store.commit(batch).await?;

        info!(
            packages = report.packages.len(),
            sessions = report.sessions_processed,
            "build complete"
        );
        Ok(report)
    }

    fn open_writer(&self, current: &Node, recipient: &Node) -> PackageWriter {
        // Broadcast numbering runs on the current node's own counter.
        let (node, target) = match self.config.routing {
            RoutingMode::Broadcast => (current.clone(), Recipient::AllNodes),
            RoutingMode::PointToPoint => {
                (recipient.clone(), Recipient::Node(recipient.id.clone()))
            }
        };
        PackageWriter {
            seq: node.next_saved_seq(),
            node,
            recipient: target,
            entries: SpillBuffer::new(self.config.spill_threshold),
            headers: HashSet::new(),
            sessions: 0,
            records: 0,
        }
    }

    fn seal(
        &self,
        current: &Node,
        writer: PackageWriter,
        now: i64,
        batch: &mut WriteBatch,
    ) -> Result<SealedPackage> {
        let name = PackageName::new(
            self.config.application.clone(),
            current.id.clone(),
            writer.recipient.clone(),
            writer.seq,
            PackageKind::Protocol,
        )?;
        let marker = Marker {
            version: PACKAGE_VERSION,
            application: name.application.clone(),
            sender: name.sender.clone(),
            recipient: name.recipient.clone(),
            seq: name.seq,
            kind: PackageKind::Protocol,
            created_at: now,
            resume_seq: None,
            entry_count: writer.entries.entry_count(),
            digest: writer.entries.digest(),
        };
        let (sessions, records) = (writer.sessions, writer.records);
        let entries = writer.entries.into_bytes()?;
        let mut bytes = Vec::with_capacity(entries.len() + 256);
        write_package(&mut bytes, &marker, &entries)?;

        let channel = channel_for(&name.recipient);
        let packed = self.packer.pack(bytes, &channel)?;

        let mut node = writer.node;
        node.last_saved_seq = writer.seq;
        batch.nodes.push(node);
        batch.packages.push(StoredPackage {
            name: name.clone(),
            direction: PackageDirection::Outgoing,
            created_at: now,
            bytes: packed.clone().into(),
        });
        batch.log.push(LogEntry::new(
            name.clone(),
            now,
            PackageEvent::Created,
            format!("{sessions} sessions, {records} records"),
        ));
        debug!(package = %name, sessions, records, "package sealed");

        Ok(SealedPackage {
            name,
            created_at: now,
            bytes: packed,
        })
    }
}

/// Channel a package addressed to `recipient` is packed for.
pub(crate) fn channel_for(recipient: &Recipient) -> Channel {
    match recipient {
        Recipient::Node(node) => Channel::Peer(node.clone()),
        Recipient::AllNodes => Channel::Broadcast,
    }
}

/// Per session: recipients that receive at least one real record somewhere
/// in its subtree. Commit markers are only forwarded to them.
fn subtree_receivers(
    plan: &RoutePlan,
    nodes: &HashMap<&NodeId, &Node>,
) -> HashMap<SessionId, HashSet<NodeId>> {
    let mut receivers: HashMap<SessionId, HashSet<NodeId>> = HashMap::new();
    for routed in plan.sessions.iter().rev() {
        let mut own: HashSet<NodeId> = receivers.remove(&routed.session.id).unwrap_or_default();
        for entry in routed.records.iter().filter(|e| e.record.is_real()) {
            for recipient in &entry.recipients {
                let covered = nodes
                    .get(recipient)
                    .map_or(true, |n| n.covered_by_snapshot(entry.record.modified_at));
                if !covered {
                    own.insert(recipient.clone());
                }
            }
        }
        if let Some(parent) = routed.session.parent {
            receivers
                .entry(parent)
                .or_default()
                .extend(own.iter().cloned());
        }
        receivers.insert(routed.session.id, own);
    }
    receivers
}

/// Headers of `id` and its ancestors in the plan, outermost first.
fn ancestry(
    id: SessionId,
    parent_of: &HashMap<SessionId, SessionId>,
    headers: &HashMap<SessionId, SessionHeader>,
) -> Vec<SessionHeader> {
    let mut chain = Vec::new();
    let mut cursor = Some(id);
    while let Some(current) = cursor {
        match headers.get(&current) {
            Some(header) => chain.push(header.clone()),
            None => break,
        }
        cursor = parent_of.get(&current).copied();
    }
    chain.reverse();
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ChangeKind, ChangeSession, Route};

    use crate::router::{RoutedRecord, RoutedSession};

    fn id(n: u128) -> SessionId {
        SessionId::from_u128(n)
    }

    fn routed(n: u128, parent: Option<u128>, records: Vec<(ChangeRecord, Vec<&str>)>) -> RoutedSession {
        let mut session = ChangeSession::new(id(n), n as i64);
        session.parent = parent.map(id);
        session.records = records.iter().map(|(r, _)| r.clone()).collect();
        RoutedSession {
            session,
            records: records
                .into_iter()
                .map(|(record, to)| RoutedRecord {
                    record,
                    recipients: to.iter().map(|n| NodeId::new(*n)).collect(),
                })
                .collect(),
        }
    }

    fn real(at: i64) -> ChangeRecord {
        ChangeRecord::new(
            ChangeKind::ObjectCreated,
            Some(ObjectRef::new("Invoice", "1")),
            at,
        )
    }

    #[test]
    fn test_subtree_receivers_bubble_up_and_respect_watermark() {
        let b = Node::new(NodeId::new("B"), "");
        let mut c = Node::new(NodeId::new("C"), "");
        c.snapshot_watermark = Some(100);
        let nodes: HashMap<&NodeId, &Node> = [(&b.id, &b), (&c.id, &c)].into_iter().collect();

        let plan = RoutePlan {
            sessions: vec![
                routed(1, None, vec![(ChangeRecord::commit_marker(9), vec!["B", "C"])]),
                routed(2, Some(1), vec![(real(50), vec!["B", "C"])]),
            ],
            processed: vec![id(1), id(2)],
        };
        let receivers = subtree_receivers(&plan, &nodes);
        // C's copy of the record predates its snapshot.
        assert_eq!(receivers[&id(1)], HashSet::from([NodeId::new("B")]));
        assert_eq!(receivers[&id(2)], HashSet::from([NodeId::new("B")]));
    }

    #[test]
    fn test_ancestry_is_outermost_first() {
        let header = |n: u128, parent: Option<u128>| SessionHeader {
            id: id(n),
            parent: parent.map(id),
            committed_at: 0,
            route: Route::new(),
        };
        let headers: HashMap<SessionId, SessionHeader> = [
            (id(1), header(1, None)),
            (id(2), header(2, Some(1))),
            (id(3), header(3, Some(2))),
        ]
        .into_iter()
        .collect();
        let parent_of: HashMap<SessionId, SessionId> =
            [(id(2), id(1)), (id(3), id(2))].into_iter().collect();
        let chain: Vec<SessionId> = ancestry(id(3), &parent_of, &headers)
            .iter()
            .map(|h| h.id)
            .collect();
        assert_eq!(chain, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn test_channel_for_recipient() {
        assert_eq!(channel_for(&Recipient::AllNodes), Channel::Broadcast);
        assert_eq!(
            channel_for(&Recipient::Node(NodeId::new("B"))),
            Channel::Peer(NodeId::new("B"))
        );
    }
}
