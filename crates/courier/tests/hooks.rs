//! Application hooks: method replay, collisions and recipient adjustment.

use courier::core::{ChangeRecord, FieldValue, NodeId, Object, Scalar};
use courier::sync::{Collision, CollisionKind, Hooks, Resolution};
use courier_testkit::Mesh;
use tokio_util::sync::CancellationToken;

fn post(object: &mut Object, _args: &[FieldValue]) -> Result<(), String> {
    object.set("Amount", FieldValue::Scalar(Scalar::Int(0)));
    Ok(())
}

#[tokio::test]
async fn test_method_call_is_replayed_through_handler() -> anyhow::Result<()> {
    let hooks = Hooks::new().with_method("Invoice", "Post", 0, post);
    let mesh = Mesh::builder(&["A", "B"]).hooks(hooks).build().await?;
    let a = mesh.node("A");

    let invoice = a.create_invoice(1, 100).await?;
    let mut edit = a.engine().edit();
    edit.call(&invoice, "Post", Vec::new()).await?;
    edit.commit().await?;

    mesh.settle(5).await?;
    assert_eq!(mesh.node("B").invoice_summary().await?, vec![(1, 0)]);
    Ok(())
}

#[tokio::test]
async fn test_strict_resolver_rolls_back_the_package() -> anyhow::Result<()> {
    // No handler for Post: the call collides and the resolver aborts.
    let strict = |collision: &Collision| match collision.kind {
        CollisionKind::UnknownMethod => Resolution::Error,
        _ => Resolution::Default,
    };
    let hooks = Hooks::new().with_collision_resolver(strict);
    let mesh = Mesh::builder(&["A", "B"]).hooks(hooks).build().await?;
    let a = mesh.node("A");

    let mut edit = a.engine().edit();
    let invoice = edit.create("Invoice").await?;
    edit.set(&invoice, "Number", Scalar::Int(1).into()).await?;
    edit.call(&invoice, "Post", Vec::new()).await?;
    edit.commit().await?;
    a.sync().await?;

    let b = mesh.node("B");
    let batch = b.sync().await?.batch;
    assert_eq!(batch.failed.len(), 1);
    assert!(batch.halted);
    assert!(b.objects("Invoice").await?.is_empty());
    assert_eq!(b.node("A").await?.unwrap().last_loaded_seq, 0);
    Ok(())
}

#[tokio::test]
async fn test_unhandled_method_is_skipped_by_default() -> anyhow::Result<()> {
    let mesh = Mesh::builder(&["A", "B"]).build().await?;
    let a = mesh.node("A");
    let invoice = a.create_invoice(1, 100).await?;
    let mut edit = a.engine().edit();
    edit.call(&invoice, "Post", Vec::new()).await?;
    edit.commit().await?;

    mesh.settle(5).await?;
    let b = mesh.node("B");
    assert_eq!(b.invoice_summary().await?, vec![(1, 100)]);
    assert_eq!(b.node("A").await?.unwrap().last_loaded_seq, 1);
    Ok(())
}

#[tokio::test]
async fn test_recipient_hook_keeps_changes_from_a_node() -> anyhow::Result<()> {
    let not_c = |_: &ChangeRecord, _: Option<&Object>, recipients: &mut Vec<NodeId>| {
        recipients.retain(|n| n.as_str() != "C");
    };
    let mesh = Mesh::builder(&["A", "B", "C"])
        .point_to_point()
        .hooks(Hooks::new().with_recipients(not_c))
        .build()
        .await?;

    mesh.node("A").create_invoice(1, 100).await?;
    mesh.settle(6).await?;
    assert_eq!(mesh.node("B").invoice_summary().await?, vec![(1, 100)]);
    assert!(mesh.node("C").objects("Invoice").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_collection_members_are_translated() -> anyhow::Result<()> {
    let mesh = Mesh::builder(&["A", "B"]).build().await?;
    let a = mesh.node("A");

    let invoice = a.create_invoice(1, 100).await?;
    let mut edit = a.engine().edit();
    let first = edit.create("Line").await?;
    let second = edit.create("Line").await?;
    edit.set(&first, "Qty", Scalar::Int(1).into()).await?;
    edit.set(&second, "Qty", Scalar::Int(2).into()).await?;
    edit.add_member(&invoice, "Lines", &first).await?;
    edit.add_member(&invoice, "Lines", &second).await?;
    edit.commit().await?;
    mesh.settle(5).await?;

    let mut edit = a.engine().edit();
    edit.remove_member(&invoice, "Lines", &first).await?;
    edit.commit().await?;
    mesh.settle(5).await?;

    let b = mesh.node("B");
    let copy = b.invoice_by_number(1).await?.unwrap();
    let FieldValue::Collection(members) = copy.get("Lines") else {
        panic!("no lines on the copy");
    };
    assert_eq!(members.len(), 1);
    let line = b.object(&members[0]).await?.unwrap();
    assert_eq!(line.get("Qty"), &FieldValue::Scalar(Scalar::Int(2)));
    assert_eq!(b.objects("Line").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_broadcast_builds_one_package_when_hook_adds_nodes() -> anyhow::Result<()> {
    let add_b = |_: &ChangeRecord, _: Option<&Object>, recipients: &mut Vec<NodeId>| {
        recipients.push(NodeId::new("B"));
    };
    let mesh = Mesh::builder(&["A", "B"])
        .hooks(Hooks::new().with_recipients(add_b))
        .build()
        .await?;
    let a = mesh.node("A");
    a.create_invoice(1, 100).await?;

    let report = a.engine().build(&CancellationToken::new(), None).await?;
    let names: Vec<String> = report.packages.iter().map(|p| p.name.file_name("pkg")).collect();
    assert_eq!(names, vec!["App-A-AllNodes-00000001-Protocol.pkg".to_string()]);
    assert_eq!(a.node("A").await?.unwrap().last_saved_seq, 1);
    Ok(())
}
