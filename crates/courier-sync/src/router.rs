//! Change routing: decides which peers receive each captured record.
//!
//! For every record of every unsaved session the router starts from the
//! candidate set of the routing mode, lets the selector filter it, runs the
//! recipient hooks, then drops the current node, disabled peers and every
//! node the session already passed through. Sessions whose whole subtree
//! holds nothing but commit markers are pruned.

use std::collections::{HashMap, HashSet};

use courier_core::{ChangeRecord, ChangeSession, Node, NodeId, Object, ObjectKey, Selector, SessionId};
use courier_store::Store;
use tracing::debug;

use crate::config::RoutingMode;
use crate::error::Result;
use crate::hooks::Hooks;

/// A record together with the nodes it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedRecord {
    pub record: ChangeRecord,
    pub recipients: Vec<NodeId>,
}

/// A session that survived pruning.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedSession {
    pub session: ChangeSession,
    pub records: Vec<RoutedRecord>,
}

/// Routing result for one build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutePlan {
    /// Surviving sessions, parents before children.
    pub sessions: Vec<RoutedSession>,
    /// Every session the router looked at, pruned ones included. All of them
    /// are marked saved when the build commits.
    pub processed: Vec<SessionId>,
}

impl RoutePlan {
    /// Whether no session survived routing.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of `id` and all its descendants in the plan.
    pub fn subtree(&self, id: SessionId) -> HashSet<SessionId> {
        let mut members = HashSet::from([id]);
        // Parents precede children, so one pass collects the subtree.
        for routed in &self.sessions {
            if let Some(parent) = routed.session.parent {
                if members.contains(&parent) {
                    members.insert(routed.session.id);
                }
            }
        }
        members
    }
}

/// Computes the recipients of each change record.
pub struct Router<'a> {
    selector: &'a dyn Selector,
    hooks: &'a Hooks,
    mode: RoutingMode,
}

impl<'a> Router<'a> {
    /// Router applying `selector` and `hooks` in `mode`.
    pub fn new(selector: &'a dyn Selector, hooks: &'a Hooks, mode: RoutingMode) -> Self {
        Self {
            selector,
            hooks,
            mode,
        }
    }

    /// Initial recipient candidates for the routing mode.
    pub fn candidates(&self, current: &Node, peers: &[Node]) -> Vec<NodeId> {
        match self.mode {
            RoutingMode::Broadcast => vec![current.id.clone()],
            RoutingMode::PointToPoint => peers
                .iter()
                .filter(|n| !n.disabled && n.id != current.id)
                .map(|n| n.id.clone())
                .collect(),
        }
    }

    /// Route `sessions` (any order) for a build by `current`.
    pub async fn route<S: Store + ?Sized>(
        &self,
        store: &S,
        current: &Node,
        peers: &[Node],
        sessions: Vec<ChangeSession>,
    ) -> Result<RoutePlan> {
        let candidates = self.candidates(current, peers);
        let disabled: HashSet<&NodeId> =
            peers.iter().filter(|n| n.disabled).map(|n| &n.id).collect();
        let processed: Vec<SessionId> = sessions.iter().map(|s| s.id).collect();

        let ordered = parents_first(sessions);
        let mut objects: HashMap<ObjectKey, Option<Object>> = HashMap::new();
        let mut routed = Vec::with_capacity(ordered.len());

        for session in ordered {
            let mut records = Vec::with_capacity(session.records.len());
            for record in &session.records {
                let mut recipients = match (&record.target, record.is_real()) {
                    (Some(target), true) => {
                        let key = target.key();
                        if !objects.contains_key(&key) {
                            let object = store.get_object(&key).await?;
                            objects.insert(key.clone(), object);
                        }
                        let object = objects.get(&key).and_then(Option::as_ref);
                        let mut allowed = self.selector.filter_nodes(
                            &target.class,
                            object,
                            record.kind,
                            &candidates,
                        );
                        self.hooks.adjust_recipients(
                            Some(target.class.as_str()),
                            record,
                            object,
                            &mut allowed,
                        );
                        allowed
                    }
                    (None, true) => {
                        let mut allowed = candidates.clone();
                        self.hooks.adjust_recipients(None, record, None, &mut allowed);
                        allowed
                    }
                    // Commit markers are filtered per recipient by the builder.
                    (_, false) => candidates.clone(),
                };

                match self.mode {
                    RoutingMode::PointToPoint => {
                        recipients.retain(|n| n != &current.id && !disabled.contains(n));
                    }
                    // One AllNodes package per build: any surviving recipient
                    // means the record is broadcast.
                    RoutingMode::Broadcast => {
                        if !recipients.is_empty() {
                            recipients = vec![current.id.clone()];
                        }
                    }
                }
                recipients.retain(|n| !session.route.contains(n));
                dedup(&mut recipients);

                records.push(RoutedRecord {
                    record: record.clone(),
                    recipients,
                });
            }
            routed.push(RoutedSession { session, records });
        }

        let sessions = prune(routed);
        debug!(
            processed = processed.len(),
            kept = sessions.len(),
            "routed change sessions"
        );
        Ok(RoutePlan {
            sessions,
            processed,
        })
    }
}

fn dedup(nodes: &mut Vec<NodeId>) {
    let mut seen = HashSet::new();
    nodes.retain(|n| seen.insert(n.clone()));
}

/// Depth-first order with siblings by commit time. A session whose parent is
/// not in the set is a root.
pub(crate) fn parents_first(mut sessions: Vec<ChangeSession>) -> Vec<ChangeSession> {
    sessions.sort_by_key(|s| s.committed_at);
    let ids: HashSet<SessionId> = sessions.iter().map(|s| s.id).collect();
    let mut children: HashMap<SessionId, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (idx, session) in sessions.iter().enumerate() {
        match session.parent {
            Some(parent) if ids.contains(&parent) => children.entry(parent).or_default().push(idx),
            _ => roots.push(idx),
        }
    }

    let mut order = Vec::with_capacity(sessions.len());
    let mut stack: Vec<usize> = roots.into_iter().rev().collect();
    while let Some(idx) = stack.pop() {
        order.push(idx);
        if let Some(kids) = children.get(&sessions[idx].id) {
            stack.extend(kids.iter().rev());
        }
    }

    let mut slots: Vec<Option<ChangeSession>> = sessions.into_iter().map(Some).collect();
    order.into_iter().filter_map(|idx| slots[idx].take()).collect()
}

/// Drop sessions whose subtree has no real record. Input is parents first.
fn prune(sessions: Vec<RoutedSession>) -> Vec<RoutedSession> {
    let mut live: HashSet<SessionId> = HashSet::new();
    let parent_of: HashMap<SessionId, SessionId> = sessions
        .iter()
        .filter_map(|s| s.session.parent.map(|p| (s.session.id, p)))
        .collect();
    // Children come after parents, so walk backwards and mark ancestors.
    for routed in sessions.iter().rev() {
        if routed.session.has_real_records() {
            let mut id = routed.session.id;
            while live.insert(id) {
                match parent_of.get(&id) {
                    Some(parent) => id = *parent,
                    None => break,
                }
            }
        }
    }
    sessions
        .into_iter()
        .filter(|s| live.contains(&s.session.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{
        ChangeKind, ClassSelector, ObjectRef, Predicate, Scalar, SelectorConfig, SelectorRule,
    };
    use courier_store::{MemoryStore, StoreExt, WriteBatch};

    fn id(n: u128) -> SessionId {
        SessionId::from_u128(n)
    }

    fn created(class: &str, obj: &str, at: i64) -> ChangeRecord {
        ChangeRecord::new(ChangeKind::ObjectCreated, Some(ObjectRef::new(class, obj)), at)
    }

    fn session(n: u128, at: i64, records: Vec<ChangeRecord>) -> ChangeSession {
        let mut s = ChangeSession::new(id(n), at);
        s.records = records;
        s
    }

    fn nodes() -> (Node, Vec<Node>) {
        let current = Node::current(NodeId::new("A"), "");
        let mut disabled = Node::new(NodeId::new("D"), "");
        disabled.disabled = true;
        let peers = vec![
            current.clone(),
            Node::new(NodeId::new("B"), ""),
            Node::new(NodeId::new("C"), ""),
            disabled,
        ];
        (current, peers)
    }

    async fn store_with_invoice(region: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store.put_node(Node::current(NodeId::new("A"), "")).await.unwrap();
        let mut batch = WriteBatch::new();
        batch.objects_put.push(
            Object::new(ObjectKey::new("Invoice", "1")).with("Region", Scalar::Text(region.into())),
        );
        store.commit(batch).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_point_to_point_skips_self_and_disabled() {
        let store = store_with_invoice("north").await;
        let (current, peers) = nodes();
        let selector = SelectorConfig::new();
        let hooks = Hooks::new();
        let router = Router::new(&selector, &hooks, RoutingMode::PointToPoint);

        let plan = router
            .route(&store, &current, &peers, vec![session(1, 10, vec![created("Invoice", "1", 5)])])
            .await
            .unwrap();
        assert_eq!(
            plan.sessions[0].records[0].recipients,
            vec![NodeId::new("B"), NodeId::new("C")]
        );
    }

    #[tokio::test]
    async fn test_selector_and_route_trail_filter() {
        let store = store_with_invoice("north").await;
        let (current, peers) = nodes();
        let selector = SelectorConfig::new().with_class(
            "Invoice",
            ClassSelector {
                mode: Default::default(),
                rules: vec![SelectorRule::exclude(Predicate::RecipientIs(NodeId::new("C")))],
            },
        );
        let hooks = Hooks::new();
        let router = Router::new(&selector, &hooks, RoutingMode::PointToPoint);

        let mut relayed = session(1, 10, vec![created("Invoice", "1", 5)]);
        relayed.route.push(NodeId::new("B"));
        let plan = router
            .route(&store, &current, &peers, vec![relayed])
            .await
            .unwrap();
        // C is excluded by the selector, B already saw the session.
        assert!(plan.sessions[0].records[0].recipients.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_targets_current_node() {
        let store = store_with_invoice("north").await;
        let (current, peers) = nodes();
        let selector = SelectorConfig::new();
        let hooks = Hooks::new();
        let router = Router::new(&selector, &hooks, RoutingMode::Broadcast);

        let plan = router
            .route(&store, &current, &peers, vec![session(1, 10, vec![created("Invoice", "1", 5)])])
            .await
            .unwrap();
        assert_eq!(plan.sessions[0].records[0].recipients, vec![NodeId::new("A")]);
    }

    #[tokio::test]
    async fn test_broadcast_collapses_hook_recipients() {
        let store = store_with_invoice("north").await;
        let (current, peers) = nodes();
        let selector = SelectorConfig::new();
        fn add_peers(_: &ChangeRecord, _: Option<&Object>, recipients: &mut Vec<NodeId>) {
            recipients.push(NodeId::new("B"));
            recipients.push(NodeId::new("C"));
        }
        fn veto_all(_: &ChangeRecord, _: Option<&Object>, recipients: &mut Vec<NodeId>) {
            recipients.clear();
        }
        let hooks = Hooks::new().with_recipients(add_peers);
        let router = Router::new(&selector, &hooks, RoutingMode::Broadcast);

        let plan = router
            .route(&store, &current, &peers, vec![session(1, 10, vec![created("Invoice", "1", 5)])])
            .await
            .unwrap();
        assert_eq!(plan.sessions[0].records[0].recipients, vec![NodeId::new("A")]);

        let veto = Hooks::new().with_recipients(veto_all);
        let router = Router::new(&selector, &veto, RoutingMode::Broadcast);
        let plan = router
            .route(&store, &current, &peers, vec![session(1, 10, vec![created("Invoice", "1", 5)])])
            .await
            .unwrap();
        assert!(plan.sessions[0].records[0].recipients.is_empty());
    }

    #[tokio::test]
    async fn test_marker_only_subtrees_are_pruned_but_processed() {
        let store = store_with_invoice("north").await;
        let (current, peers) = nodes();
        let selector = SelectorConfig::new();
        let hooks = Hooks::new();
        let router = Router::new(&selector, &hooks, RoutingMode::PointToPoint);

        let root = session(1, 30, vec![ChangeRecord::commit_marker(30)]);
        let live_child =
            session(2, 20, vec![created("Invoice", "1", 5), ChangeRecord::commit_marker(20)])
                .child_of(id(1));
        let dead = session(3, 25, vec![ChangeRecord::commit_marker(25)]);

        let plan = router
            .route(&store, &current, &peers, vec![live_child, root, dead])
            .await
            .unwrap();
        let kept: Vec<SessionId> = plan.sessions.iter().map(|s| s.session.id).collect();
        // Root kept for its child and ordered before it.
        assert_eq!(kept, vec![id(1), id(2)]);
        assert_eq!(plan.processed.len(), 3);
        assert_eq!(plan.subtree(id(1)), HashSet::from([id(1), id(2)]));
    }

    #[test]
    fn test_parents_first_orders_siblings_by_commit() {
        let parent = session(1, 50, vec![]);
        let late = session(2, 40, vec![]).child_of(id(1));
        let early = session(3, 10, vec![]).child_of(id(1));
        let orphan = session(4, 5, vec![]).child_of(id(99));
        let order: Vec<SessionId> = parents_first(vec![parent, late, early, orphan])
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(order, vec![id(4), id(1), id(3), id(2)]);
    }
}
