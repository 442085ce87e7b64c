//! Identity resolution: mapping a sender's object descriptor to a local
//! object.
//!
//! Resolution order:
//!
//! 1. The identity map entry for `(peer, class, remote id)`
//! 2. The descriptor's known mappings: an entry naming the current node is
//!    a local id, an entry naming a third node goes through that node's
//!    identity map
//! 3. The class's natural key, compared after normalization
//!
//! A hit found by steps 2 or 3 is registered as a placeholder so later
//! lookups in the same unit of work are direct.

use courier_core::{NodeId, ObjectKey, PackagedRef, Schema};
use courier_store::Store;
use tracing::trace;

use crate::error::Result;
use crate::uow::UnitOfWork;

/// Maps references from other nodes onto local objects.
pub struct IdentityResolver<'a> {
    schema: &'a Schema,
    current: &'a NodeId,
}

impl<'a> IdentityResolver<'a> {
    /// Resolver for the node `current`.
    pub fn new(schema: &'a Schema, current: &'a NodeId) -> Self {
        Self { schema, current }
    }

    /// Find the local object `reference` (sent by `peer`) stands for.
    pub async fn resolve<S: Store + ?Sized>(
        &self,
        uow: &mut UnitOfWork<'_, S>,
        reference: &PackagedRef,
        peer: &NodeId,
    ) -> Result<Option<ObjectKey>> {
        let class = reference.class.as_str();

        // 1. Identity map
        if let Some(local) = uow.lookup_identity(peer, class, &reference.id).await? {
            if uow.exists(&local).await? {
                return Ok(Some(local));
            }
        }

        // 2. Known mappings
        for mapping in &reference.known_mapping {
            let candidate = if &mapping.node == self.current {
                Some(ObjectKey::new(class, mapping.object_id.clone()))
            } else if &mapping.node != peer {
                uow.lookup_identity(&mapping.node, class, &mapping.object_id)
                    .await?
            } else {
                None
            };
            if let Some(local) = candidate {
                if uow.exists(&local).await? {
                    trace!(class, remote = %reference.id, via = %mapping.node, "resolved by known mapping");
                    self.register(uow, reference, peer, &local);
                    return Ok(Some(local));
                }
            }
        }

        // 3. Natural key
        if let Some(local) = self.by_natural_key(uow, reference).await? {
            trace!(class, remote = %reference.id, "resolved by natural key");
            self.register(uow, reference, peer, &local);
            return Ok(Some(local));
        }

        Ok(None)
    }

    /// Remember that `reference` from `peer` is the local object `local`.
    pub fn register<S: Store + ?Sized>(
        &self,
        uow: &mut UnitOfWork<'_, S>,
        reference: &PackagedRef,
        peer: &NodeId,
        local: &ObjectKey,
    ) {
        uow.register_identity(peer, &reference.class, &reference.id, local.clone());
    }

    async fn by_natural_key<S: Store + ?Sized>(
        &self,
        uow: &UnitOfWork<'_, S>,
        reference: &PackagedRef,
    ) -> Result<Option<ObjectKey>> {
        let Some(value) = reference.replication_key.as_deref() else {
            return Ok(None);
        };
        let Some(class) = self.schema.class(&reference.class) else {
            return Ok(None);
        };
        let Some(natural_key) = class.natural_key.as_ref() else {
            return Ok(None);
        };
        let wanted = natural_key.normalize(value);
        // First match by id wins when several objects share a key.
        for object in uow.list(&class.name).await? {
            if let Some(candidate) = class.natural_key_of(&object) {
                if natural_key.normalize(&candidate) == wanted {
                    return Ok(Some(object.key));
                }
            }
        }
        Ok(None)
    }
}
