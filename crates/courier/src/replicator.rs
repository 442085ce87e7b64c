//! The Replicator: a node's replication service.
//!
//! The Replicator drives the engine against a transport: it uploads what the
//! engine builds, imports what peers addressed to this node, loads imported
//! packages in order under the configured batch policy, and exchanges
//! tickets about delivery.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::canonical::{decode_ticket, encode_ticket};
use courier_core::{
    now_millis, peek_marker, Node, NodeId, PackageKind, PackageName, Recipient, Schema, Ticket,
    TicketEvent,
};
use courier_seal::Channel;
use courier_store::{
    LogEntry, PackageDirection, PackageEvent, Store, StoreExt, StoredPackage, WriteBatch,
};
use courier_sync::{
    BuildReport, Engine, FileMask, LoadOutcome, ProgressTx, SyncError, Transport,
};

use crate::config::{BatchPolicy, ReplicatorConfig};
use crate::error::Result;
use crate::task::TaskHandle;

/// Result of [`Replicator::send`].
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    pub build: BuildReport,
    /// Packages uploaded, including ones left over from earlier runs.
    pub uploaded: Vec<PackageName>,
}

/// Result of [`Replicator::receive`].
#[derive(Debug, Clone, Default)]
pub struct ReceiveReport {
    pub imported: Vec<PackageName>,
}

/// Result of [`Replicator::load_pending`].
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub loaded: Vec<PackageName>,
    /// Protocol packages older than the bootstrap snapshot.
    pub covered: Vec<PackageName>,
    pub rejected: Vec<(PackageName, String)>,
    pub failed: Vec<(PackageName, String)>,
    /// Not attempted because the batch or the sender's stream stopped.
    pub held: Vec<PackageName>,
    /// The whole batch stopped at a failure.
    pub halted: bool,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.failed.is_empty() && self.held.is_empty()
    }
}

/// Result of one [`Replicator::sync_once`] round.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub tickets: usize,
    pub sent: SendReport,
    pub received: ReceiveReport,
    pub batch: BatchReport,
}

/// One node's replication service. Clones share the engine and transport.
pub struct Replicator<S: Store, T: Transport> {
    engine: Arc<Engine<S>>,
    transport: Arc<T>,
    config: ReplicatorConfig,
}

impl<S: Store, T: Transport> Clone for Replicator<S, T> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<S: Store, T: Transport> Replicator<S, T> {
    /// Create a service with an engine built from `config.engine`.
    pub fn open(store: Arc<S>, schema: Schema, transport: T, config: ReplicatorConfig) -> Self {
        let engine = Engine::new(store, schema, config.engine.clone());
        Self::new(engine, transport, config)
    }

    /// Wrap an engine configured by the caller. The engine's own
    /// configuration wins over `config.engine`.
    pub fn new(engine: Engine<S>, transport: T, mut config: ReplicatorConfig) -> Self {
        config.engine = engine.config().clone();
        Self {
            engine: Arc::new(engine),
            transport: Arc::new(transport),
            config,
        }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    pub fn store(&self) -> &S {
        self.engine.store()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    async fn current(&self) -> Result<Node> {
        Ok(self
            .store()
            .current_node()
            .await?
            .ok_or(SyncError::NotInitialized)?)
    }

    fn mask(&self, ext: &str, node: &NodeId) -> FileMask {
        FileMask::new(self.config.engine.application.clone(), ext).to(node)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Package log
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn packages(&self, direction: PackageDirection) -> Result<Vec<StoredPackage>> {
        Ok(self.store().list_packages(direction).await?)
    }

    pub async fn package_log(&self, name: &PackageName) -> Result<Vec<LogEntry>> {
        Ok(self.store().package_log(name).await?)
    }

    async fn has_event(&self, name: &PackageName, events: &[PackageEvent]) -> Result<bool> {
        let log = self.store().package_log(name).await?;
        Ok(log.iter().any(|entry| events.contains(&entry.event)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Build packages for every unsaved change and upload everything not yet
    /// sent.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<SendReport> {
        let build = self.engine.build(cancel, progress).await?;
        let mut report = SendReport {
            build,
            uploaded: Vec::new(),
        };

        let mut outgoing = self.packages(PackageDirection::Outgoing).await?;
        outgoing.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        for package in outgoing {
            if cancel.is_cancelled() {
                break;
            }
            if self.has_event(&package.name, &[PackageEvent::Sent]).await? {
                continue;
            }
            self.upload(&package.name, package.bytes.to_vec()).await?;
            report.uploaded.push(package.name);
        }
        Ok(report)
    }

    /// Build a snapshot for `recipient` and upload it.
    pub async fn send_snapshot(
        &self,
        recipient: &NodeId,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<PackageName> {
        let package = self
            .engine
            .build_snapshot(recipient, cancel, progress)
            .await?;
        self.upload(&package.name, package.bytes).await?;
        Ok(package.name)
    }

    async fn upload(&self, name: &PackageName, bytes: Vec<u8>) -> Result<()> {
        let file = name.file_name(&self.config.package_extension);
        self.transport.upload(&file, bytes).await?;
        self.store()
            .append_log(LogEntry::new(
                name.clone(),
                now_millis(),
                PackageEvent::Sent,
                format!("uploaded as {file}"),
            ))
            .await?;
        info!(package = %name, "sent");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Download every package addressed to this node that is not stored yet.
    ///
    /// Packages addressed to this node alone are removed from the transport
    /// once stored; broadcasts stay for the other nodes.
    pub async fn receive(&self, cancel: &CancellationToken) -> Result<ReceiveReport> {
        let current = self.current().await?;
        let mask = self.mask(&self.config.package_extension, &current.id);
        let mut report = ReceiveReport::default();

        for file in self.transport.list(&mask).await? {
            if cancel.is_cancelled() {
                break;
            }
            let name = PackageName::parse(&file)?;
            if self.store().get_package(&name).await?.is_some() {
                continue;
            }
            let bytes = self.transport.download(&file).await?;
            let now = now_millis();
            let mut batch = WriteBatch::new().log(LogEntry::new(
                name.clone(),
                now,
                PackageEvent::Imported,
                format!("downloaded {file}"),
            ));
            batch.packages.push(StoredPackage {
                name: name.clone(),
                direction: PackageDirection::Incoming,
                created_at: now,
                bytes: bytes.into(),
            });
            self.store().commit(batch).await?;
            if name.recipient != Recipient::AllNodes {
                self.transport.delete(&file).await?;
            }
            debug!(package = %name, "imported");
            report.imported.push(name);
        }
        Ok(report)
    }

    /// Package date used for load ordering. Packages whose marker cannot be
    /// read sort first so they are rejected before anything else runs.
    fn package_date(&self, package: &StoredPackage) -> i64 {
        let channel = match &package.name.recipient {
            Recipient::AllNodes => Channel::Broadcast,
            Recipient::Node(_) => Channel::Peer(package.name.sender.clone()),
        };
        self.engine
            .packer()
            .unpack(package.bytes.to_vec(), &channel)
            .ok()
            .and_then(|plain| peek_marker(&plain).ok())
            .map_or(i64::MIN, |marker| marker.created_at)
    }

    /// Whether the sender's counters already moved past `name`.
    async fn is_stale(&self, name: &PackageName) -> Result<bool> {
        let Some(sender) = self.store().get_node(&name.sender).await? else {
            return Ok(false);
        };
        Ok(match name.kind {
            PackageKind::Protocol => name.seq <= sender.last_loaded_seq,
            PackageKind::Snapshot => name.seq <= sender.last_loaded_snapshot_seq,
        })
    }

    /// Load imported packages that have not been loaded yet, in package
    /// date order after any snapshots.
    pub async fn load_pending(
        &self,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<BatchReport> {
        let current = self.current().await?;
        let settled = [PackageEvent::Loaded, PackageEvent::CoveredBySnapshot];

        let mut pending = Vec::new();
        for package in self.packages(PackageDirection::Incoming).await? {
            if self.has_event(&package.name, &settled).await? {
                continue;
            }
            if self.is_stale(&package.name).await? {
                debug!(package = %package.name, "superseded, not loading");
                continue;
            }
            pending.push((self.package_date(&package), package));
        }
        // Snapshots first, so older protocol packages fall under the
        // bootstrap watermark instead of tripping the sequence check.
        pending.sort_by_key(|(date, package)| {
            (package.name.kind != PackageKind::Snapshot, *date, package.name.clone())
        });

        let mut report = BatchReport::default();
        let mut stopped: HashSet<NodeId> = HashSet::new();
        for (_, package) in pending {
            let name = package.name;
            if report.halted || stopped.contains(&name.sender) {
                report.held.push(name);
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = match self
                .engine
                .load(&name, package.bytes.to_vec(), cancel, progress)
                .await
            {
                Ok(outcome) => outcome,
                Err(SyncError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let failure = match outcome {
                LoadOutcome::Loaded(_) => {
                    self.send_ticket(&current.id, &name, TicketEvent::Loaded, None)
                        .await;
                    report.loaded.push(name);
                    continue;
                }
                LoadOutcome::CoveredBySnapshot => {
                    self.send_ticket(&current.id, &name, TicketEvent::Loaded, None)
                        .await;
                    report.covered.push(name);
                    continue;
                }
                LoadOutcome::Rejected(e) => {
                    let reason = e.to_string();
                    report.rejected.push((name.clone(), reason.clone()));
                    reason
                }
                LoadOutcome::Failed(reason) => {
                    report.failed.push((name.clone(), reason.clone()));
                    reason
                }
            };
            self.send_ticket(&current.id, &name, TicketEvent::Rejected, Some(failure))
                .await;
            match self.config.batch_policy {
                BatchPolicy::HaltOnFailure => {
                    warn!(package = %name, "batch halted");
                    report.halted = true;
                }
                BatchPolicy::IsolateSender => {
                    warn!(package = %name, sender = %name.sender, "sender stream stopped");
                    stopped.insert(name.sender.clone());
                }
            }
        }
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tickets
    // ─────────────────────────────────────────────────────────────────────────

    /// Tickets are advisory: failing to send one is logged, not returned.
    async fn send_ticket(
        &self,
        current: &NodeId,
        package: &PackageName,
        event: TicketEvent,
        message: Option<String>,
    ) {
        if !self.config.send_tickets {
            return;
        }
        if let Err(e) = self.try_send_ticket(current, package, event, message).await {
            warn!(package = %package, error = %e, "ticket not sent");
        }
    }

    async fn try_send_ticket(
        &self,
        current: &NodeId,
        package: &PackageName,
        event: TicketEvent,
        message: Option<String>,
    ) -> Result<()> {
        let ticket = Ticket {
            package: package.clone(),
            from: current.clone(),
            event,
            at: now_millis(),
            message,
        };
        let packed = self
            .engine
            .packer()
            .pack(encode_ticket(&ticket)?, &Channel::Peer(package.sender.clone()))?;
        let file = package
            .ticket_name(current)
            .file_name(&self.config.ticket_extension);
        self.transport.upload(&file, packed).await?;
        Ok(())
    }

    /// Attach every ticket addressed to this node to the package it is
    /// about, then remove it from the transport. Returns the number applied.
    pub async fn process_tickets(&self) -> Result<usize> {
        let current = self.current().await?;
        let mask = self.mask(&self.config.ticket_extension, &current.id);
        let mut processed = 0;

        for file in self.transport.list(&mask).await? {
            let name = PackageName::parse(&file)?;
            let bytes = self.transport.download(&file).await?;
            let ticket = match self.read_ticket(&name, bytes) {
                Ok(ticket) => ticket,
                Err(e) => {
                    warn!(file = %file, error = %e, "unreadable ticket dropped");
                    self.transport.delete(&file).await?;
                    continue;
                }
            };
            let entry = LogEntry::new(
                ticket.package.clone(),
                ticket.at,
                PackageEvent::Ticket {
                    from: ticket.from.clone(),
                    event: ticket.event,
                },
                ticket.message.clone().unwrap_or_default(),
            );
            self.store().append_log(entry).await?;
            self.transport.delete(&file).await?;
            debug!(package = %ticket.package, from = %ticket.from, event = %ticket.event, "ticket");
            processed += 1;
        }
        Ok(processed)
    }

    fn read_ticket(&self, name: &PackageName, bytes: Vec<u8>) -> Result<Ticket> {
        let plain = self
            .engine
            .packer()
            .unpack(bytes, &Channel::Peer(name.sender.clone()))?;
        let ticket = decode_ticket(&plain)?;
        if ticket.from != name.sender {
            return Err(SyncError::TransportError(format!(
                "ticket from {} stored as {name}",
                ticket.from
            ))
            .into());
        }
        Ok(ticket)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rounds and background tasks
    // ─────────────────────────────────────────────────────────────────────────

    /// Tickets, send, receive, then load.
    pub async fn sync_once(
        &self,
        cancel: &CancellationToken,
        progress: Option<&ProgressTx>,
    ) -> Result<SyncReport> {
        let tickets = self.process_tickets().await?;
        let sent = self.send(cancel, progress).await?;
        let received = self.receive(cancel).await?;
        let batch = self.load_pending(cancel, progress).await?;
        Ok(SyncReport {
            tickets,
            sent,
            received,
            batch,
        })
    }
}

impl<S: Store + 'static, T: Transport + 'static> Replicator<S, T> {
    /// Run [`sync_once`](Self::sync_once) on a background task.
    pub fn spawn_sync(&self) -> TaskHandle<SyncReport> {
        let this = self.clone();
        TaskHandle::spawn(move |cancel, progress| async move {
            this.sync_once(&cancel, Some(&progress)).await
        })
    }

    /// Run [`send`](Self::send) on a background task.
    pub fn spawn_send(&self) -> TaskHandle<SendReport> {
        let this = self.clone();
        TaskHandle::spawn(move |cancel, progress| async move {
            this.send(&cancel, Some(&progress)).await
        })
    }

    /// Run [`load_pending`](Self::load_pending) on a background task.
    pub fn spawn_load(&self) -> TaskHandle<BatchReport> {
        let this = self.clone();
        TaskHandle::spawn(move |cancel, progress| async move {
            this.load_pending(&cancel, Some(&progress)).await
        })
    }

    /// Run [`send_snapshot`](Self::send_snapshot) on a background task.
    pub fn spawn_snapshot(&self, recipient: NodeId) -> TaskHandle<PackageName> {
        let this = self.clone();
        TaskHandle::spawn(move |cancel, progress| async move {
            this.send_snapshot(&recipient, &cancel, Some(&progress)).await
        })
    }
}
