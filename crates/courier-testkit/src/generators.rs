//! Proptest generators for property-based testing.

use proptest::prelude::*;

use courier_core::{NodeId, ObjectKey, Scalar};

use crate::fixtures::TestNode;

/// Generate a node id that is valid inside a package file name.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    "[A-Z][A-Za-z0-9_]{0,7}".prop_map(NodeId::new)
}

/// Generate a scalar value of any type.
pub fn scalar() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        any::<bool>().prop_map(Scalar::Bool),
        any::<i64>().prop_map(Scalar::Int),
        (-1.0e9f64..1.0e9).prop_map(Scalar::Float),
        "[ -~]{0,24}".prop_map(Scalar::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Scalar::Bytes),
    ]
}

/// One step of an edit script. Indexes select among the invoices alive at
/// that point, modulo their count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Create { amount: i64 },
    SetAmount { index: usize, amount: i64 },
    Delete { index: usize },
}

pub fn edit_op() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        3 => (0i64..10_000).prop_map(|amount| EditOp::Create { amount }),
        2 => (any::<usize>(), 0i64..10_000)
            .prop_map(|(index, amount)| EditOp::SetAmount { index, amount }),
        1 => any::<usize>().prop_map(|index| EditOp::Delete { index }),
    ]
}

/// Generate a script of up to `max_len` edits.
pub fn edit_script(max_len: usize) -> impl Strategy<Value = Vec<EditOp>> {
    prop::collection::vec(edit_op(), 1..=max_len.max(1))
}

/// A permutation of `0..n`, the order in which `n` packages arrive.
pub fn delivery_order(n: usize) -> impl Strategy<Value = Vec<usize>> {
    Just((0..n).collect::<Vec<_>>()).prop_shuffle()
}

/// Apply `script` on `node`, one committed session per step.
///
/// Invoices are numbered in creation order so natural keys never collide.
/// Returns the invoices still alive.
pub async fn apply_script(node: &TestNode, script: &[EditOp]) -> courier::Result<Vec<ObjectKey>> {
    let mut alive: Vec<ObjectKey> = Vec::new();
    let mut next_number = 1;
    for op in script {
        match *op {
            EditOp::Create { amount } => {
                alive.push(node.create_invoice(next_number, amount).await?);
                next_number += 1;
            }
            EditOp::SetAmount { index, amount } if !alive.is_empty() => {
                let key = &alive[index % alive.len()];
                node.set_amount(key, amount).await?;
            }
            EditOp::Delete { index } if !alive.is_empty() => {
                let key = alive.remove(index % alive.len());
                node.delete(&key).await?;
            }
            _ => {}
        }
    }
    Ok(alive)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn prop_node_ids_are_valid(id in node_id()) {
            prop_assert!(id.is_valid());
        }

        #[test]
        fn prop_delivery_order_is_permutation(order in delivery_order(6)) {
            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..6).collect::<Vec<_>>());
        }

        #[test]
        fn prop_scalars_roundtrip_through_text(value in scalar()) {
            let parsed = Scalar::parse(value.scalar_type(), &value.to_text()).unwrap();
            prop_assert_eq!(parsed, value);
        }
    }
}
