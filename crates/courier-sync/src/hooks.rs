//! Application hooks consulted while routing and replaying.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use courier_core::{ChangeRecord, FieldValue, NodeId, Object};

/// Why a replayed record could not be applied as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollisionKind {
    ObjectNotFound,
    ObjectAlreadyExists,
    UnknownProperty,
    ReadOnlyProperty,
    ReferenceNotFound,
    UnknownMethod,
}

/// One replay collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub kind: CollisionKind,
    pub class: String,
    /// Object id on the sending node.
    pub remote_id: Option<String>,
    /// Property or method involved.
    pub member: Option<String>,
}

impl Collision {
    /// Collision of `kind` on `class`.
    pub fn new(kind: CollisionKind, class: impl Into<String>) -> Self {
        Self {
            kind,
            class: class.into(),
            remote_id: None,
            member: None,
        }
    }

    /// Id of the remote object involved.
    pub fn object(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    /// Property or method involved.
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }
}

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on {}", self.kind, self.class)?;
        if let Some(id) = &self.remote_id {
            write!(f, " {id}")?;
        }
        if let Some(member) = &self.member {
            write!(f, ".{member}")?;
        }
        Ok(())
    }
}

/// What to do about a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Built-in heuristic: map onto an existing object, otherwise skip the
    /// record. A missing old-value reference is ignored.
    #[default]
    Default,
    Skip,
    /// Abort the package.
    Error,
}

/// Decides what replay does about a collision.
pub trait CollisionResolver: Send + Sync {
    fn resolve(&self, collision: &Collision) -> Resolution;
}

/// Always answers [`Resolution::Default`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResolver;

impl CollisionResolver for DefaultResolver {
    fn resolve(&self, _collision: &Collision) -> Resolution {
        Resolution::Default
    }
}

/// Closures work as resolvers.
impl<F> CollisionResolver for F
where
    F: Fn(&Collision) -> Resolution + Send + Sync,
{
    fn resolve(&self, collision: &Collision) -> Resolution {
        self(collision)
    }
}

/// Adjusts the recipient set of one change record after the selector ran.
pub trait RecipientHook: Send + Sync {
    fn adjust(&self, record: &ChangeRecord, object: Option<&Object>, recipients: &mut Vec<NodeId>);
}

impl<F> RecipientHook for F
where
    F: Fn(&ChangeRecord, Option<&Object>, &mut Vec<NodeId>) + Send + Sync,
{
    fn adjust(&self, record: &ChangeRecord, object: Option<&Object>, recipients: &mut Vec<NodeId>) {
        self(record, object, recipients)
    }
}

/// Final say on whether an object goes into a snapshot for `recipient`.
pub trait SnapshotVeto: Send + Sync {
    fn allows(&self, object: &Object, recipient: &NodeId) -> bool;
}

impl<F> SnapshotVeto for F
where
    F: Fn(&Object, &NodeId) -> bool + Send + Sync,
{
    fn allows(&self, object: &Object, recipient: &NodeId) -> bool {
        self(object, recipient)
    }
}

/// Replays a recorded method call against the local target.
pub trait MethodHandler: Send + Sync {
    fn invoke(&self, target: &mut Object, args: &[FieldValue]) -> Result<(), String>;
}

impl<F> MethodHandler for F
where
    F: Fn(&mut Object, &[FieldValue]) -> Result<(), String> + Send + Sync,
{
    fn invoke(&self, target: &mut Object, args: &[FieldValue]) -> Result<(), String> {
        self(target, args)
    }
}

/// Method handlers keyed by class, name and parameter count.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: HashMap<(String, String, usize), Arc<dyn MethodHandler>>,
}

impl MethodRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `class.method` taking `params` arguments.
    pub fn register(
        &mut self,
        class: &str,
        method: &str,
        params: usize,
        handler: impl MethodHandler + 'static,
    ) {
        self.handlers
            .insert((class.to_string(), method.to_string(), params), Arc::new(handler));
    }

    /// Handler for `class.method` with `params` arguments.
    pub fn get(&self, class: &str, method: &str, params: usize) -> Option<Arc<dyn MethodHandler>> {
        self.handlers
            .get(&(class.to_string(), method.to_string(), params))
            .cloned()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Every hook the engine consults.
#[derive(Clone)]
pub struct Hooks {
    pub collisions: Arc<dyn CollisionResolver>,
    /// Per-class recipient hooks, run before the global one.
    pub class_recipients: HashMap<String, Arc<dyn RecipientHook>>,
    pub recipients: Option<Arc<dyn RecipientHook>>,
    pub snapshot_veto: Option<Arc<dyn SnapshotVeto>>,
    pub methods: MethodRegistry,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            collisions: Arc::new(DefaultResolver),
            class_recipients: HashMap::new(),
            recipients: None,
            snapshot_veto: None,
            methods: MethodRegistry::new(),
        }
    }
}

impl Hooks {
    /// Default hooks: best-effort collisions, no recipient changes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default collision resolver.
    pub fn with_collision_resolver(mut self, resolver: impl CollisionResolver + 'static) -> Self {
        self.collisions = Arc::new(resolver);
        self
    }

    /// Adjust recipients of records targeting `class`.
    pub fn with_class_recipients(mut self, class: &str, hook: impl RecipientHook + 'static) -> Self {
        self.class_recipients.insert(class.to_string(), Arc::new(hook));
        self
    }

    /// Adjust recipients of every record, after the class hooks.
    pub fn with_recipients(mut self, hook: impl RecipientHook + 'static) -> Self {
        self.recipients = Some(Arc::new(hook));
        self
    }

    /// Keep objects out of snapshots.
    pub fn with_snapshot_veto(mut self, veto: impl SnapshotVeto + 'static) -> Self {
        self.snapshot_veto = Some(Arc::new(veto));
        self
    }

    /// Handle replayed calls of `class.name` with `params` arguments.
    pub fn with_method(
        mut self,
        class: &str,
        method: &str,
        params: usize,
        handler: impl MethodHandler + 'static,
    ) -> Self {
        self.methods.register(class, method, params, handler);
        self
    }

    /// Run the class hook for `class`, then the global hook.
    pub fn adjust_recipients(
        &self,
        class: Option<&str>,
        record: &ChangeRecord,
        object: Option<&Object>,
        recipients: &mut Vec<NodeId>,
    ) {
        if let Some(hook) = class.and_then(|c| self.class_recipients.get(c)) {
            hook.adjust(record, object, recipients);
        }
        if let Some(hook) = &self.recipients {
            hook.adjust(record, object, recipients);
        }
    }

    /// Whether the veto lets `object` into a snapshot for `recipient`.
    pub fn snapshot_allows(&self, object: &Object, recipient: &NodeId) -> bool {
        self.snapshot_veto
            .as_ref()
            .map_or(true, |veto| veto.allows(object, recipient))
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("class_recipients", &self.class_recipients.keys().collect::<Vec<_>>())
            .field("recipients", &self.recipients.is_some())
            .field("snapshot_veto", &self.snapshot_veto.is_some())
            .field("methods", &self.methods)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ChangeKind, ObjectKey, ObjectRef, Scalar};

    #[test]
    fn test_closure_resolver() {
        let hooks = Hooks::new().with_collision_resolver(|c: &Collision| {
            if c.kind == CollisionKind::UnknownMethod {
                Resolution::Error
            } else {
                Resolution::Skip
            }
        });
        let unknown = Collision::new(CollisionKind::UnknownMethod, "Invoice").member("Post");
        assert_eq!(hooks.collisions.resolve(&unknown), Resolution::Error);
        assert_eq!(unknown.to_string(), "UnknownMethod on Invoice.Post");
    }

    #[test]
    fn test_class_hook_runs_before_global() {
        let hooks = Hooks::new()
            .with_class_recipients(
                "Invoice",
                |_: &ChangeRecord, _: Option<&Object>, r: &mut Vec<NodeId>| r.push(NodeId::new("HQ")),
            )
            .with_recipients(|_: &ChangeRecord, _: Option<&Object>, r: &mut Vec<NodeId>| {
                r.retain(|n| n.as_str() != "B")
            });
        let record = ChangeRecord::new(
            ChangeKind::ObjectCreated,
            Some(ObjectRef::new("Invoice", "1")),
            1,
        );
        let mut recipients = vec![NodeId::new("B"), NodeId::new("C")];
        hooks.adjust_recipients(Some("Invoice"), &record, None, &mut recipients);
        assert_eq!(recipients, vec![NodeId::new("C"), NodeId::new("HQ")]);
    }

    #[test]
    fn test_method_registry_keys_on_arity() {
        let hooks = Hooks::new().with_method(
            "Invoice",
            "Discount",
            1,
            |target: &mut Object, args: &[FieldValue]| {
                target.set("Discount", args[0].clone());
                Ok(())
            },
        );
        assert!(hooks.methods.get("Invoice", "Discount", 2).is_none());
        let handler = hooks.methods.get("Invoice", "Discount", 1).unwrap();
        let mut invoice = Object::new(ObjectKey::new("Invoice", "1"));
        handler
            .invoke(&mut invoice, &[FieldValue::Scalar(Scalar::Int(5))])
            .unwrap();
        assert_eq!(invoice.get("Discount"), &FieldValue::Scalar(Scalar::Int(5)));
    }
}
