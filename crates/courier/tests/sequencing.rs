//! Gap-free sequencing and batch failure policies.

use courier::core::{SealedPackage, ValidationError};
use courier::store::PackageEvent;
use courier::{BatchPolicy, EngineConfig, LoadOutcome, ReplicatorConfig, Transport};
use courier_testkit::{apply_script, delivery_order, edit_script, Mesh, TestNode};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

/// One package per invoice, built on `node`.
async fn packages(node: &TestNode, count: i64) -> courier::Result<Vec<SealedPackage>> {
    let mut built = Vec::new();
    for number in 1..=count {
        node.create_invoice(number, number * 10).await?;
        let report = node.engine().build(&CancellationToken::new(), None).await?;
        built.extend(report.packages);
    }
    Ok(built)
}

#[tokio::test]
async fn test_gap_is_rejected_without_side_effects() -> anyhow::Result<()> {
    let mesh = Mesh::builder(&["A", "B"]).build().await?;
    let built = packages(mesh.node("A"), 2).await?;
    let b = mesh.node("B");
    let cancel = CancellationToken::new();

    let outcome = b
        .engine()
        .load(&built[1].name, built[1].bytes.clone(), &cancel, None)
        .await?;
    assert_eq!(
        outcome,
        LoadOutcome::Rejected(ValidationError::InvalidSequence {
            expected: 1,
            got: 2
        })
    );
    assert!(b.objects("Invoice").await?.is_empty());
    assert_eq!(b.node("A").await?.unwrap().last_loaded_seq, 0);
    let log = b.replicator.package_log(&built[1].name).await?;
    assert_eq!(log.last().map(|e| &e.event), Some(&PackageEvent::Rejected));

    for package in &built {
        let outcome = b
            .engine()
            .load(&package.name, package.bytes.clone(), &cancel, None)
            .await?;
        assert!(outcome.is_success(), "{outcome:?}");
    }
    assert_eq!(b.invoice_summary().await?, vec![(1, 10), (2, 20)]);
    Ok(())
}

#[tokio::test]
async fn test_unknown_sender_is_rejected() -> anyhow::Result<()> {
    let mesh = Mesh::builder(&["A", "B"]).build().await?;
    let built = packages(mesh.node("A"), 1).await?;
    let b = mesh.node("B");
    b.engine().remove_peer(&built[0].name.sender).await?;

    let outcome = b
        .engine()
        .load(&built[0].name, built[0].bytes.clone(), &CancellationToken::new(), None)
        .await?;
    assert!(matches!(
        outcome,
        LoadOutcome::Rejected(ValidationError::UnknownSender(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_anonymous_sender_is_accepted_when_allowed() -> anyhow::Result<()> {
    let config = ReplicatorConfig::new(EngineConfig::new(courier_testkit::APP).allow_anonymous());
    let mesh = Mesh::builder(&["A", "B"]).config(config).build().await?;
    let built = packages(mesh.node("A"), 1).await?;
    let b = mesh.node("B");
    b.engine().remove_peer(&built[0].name.sender).await?;

    let outcome = b
        .engine()
        .load(&built[0].name, built[0].bytes.clone(), &CancellationToken::new(), None)
        .await?;
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(b.node("A").await?.unwrap().last_loaded_seq, 1);
    Ok(())
}

/// A loses its first package, then both A and C send one more.
async fn lossy_mesh(policy: BatchPolicy) -> courier::Result<Mesh> {
    let config = ReplicatorConfig::new(EngineConfig::new(courier_testkit::APP))
        .with_batch_policy(policy);
    let mesh = Mesh::builder(&["A", "B", "C"]).config(config).build().await?;
    let a = mesh.node("A");
    let c = mesh.node("C");

    a.create_invoice(1, 10).await?;
    let lost = a.sync().await?.sent.uploaded;
    for name in &lost {
        mesh.transport.delete(&name.file_name("pkg")).await?;
    }
    a.create_invoice(2, 20).await?;
    a.sync().await?;
    c.create_invoice(3, 30).await?;
    c.sync().await?;
    Ok(mesh)
}

#[tokio::test]
async fn test_halt_on_failure_holds_the_rest_of_the_batch() -> anyhow::Result<()> {
    let mesh = lossy_mesh(BatchPolicy::HaltOnFailure).await?;
    let b = mesh.node("B");

    let batch = b.sync().await?.batch;
    assert!(batch.halted);
    assert_eq!(batch.rejected.len(), 1);
    assert_eq!(batch.rejected[0].0.sender.as_str(), "A");
    assert_eq!(batch.held.len(), 1);
    assert_eq!(batch.held[0].sender.as_str(), "C");
    assert!(b.objects("Invoice").await?.is_empty());

    // The sender hears about the rejection.
    mesh.node("A").sync().await?;
    let name = &batch.rejected[0].0;
    let log = mesh.node("A").replicator.package_log(name).await?;
    assert!(log
        .iter()
        .any(|e| matches!(&e.event, PackageEvent::Ticket { from, .. } if from.as_str() == "B")));
    Ok(())
}

#[tokio::test]
async fn test_isolate_sender_keeps_other_streams_going() -> anyhow::Result<()> {
    let mesh = lossy_mesh(BatchPolicy::IsolateSender).await?;
    let b = mesh.node("B");

    let batch = b.sync().await?.batch;
    assert!(!batch.halted);
    assert_eq!(batch.rejected.len(), 1);
    assert_eq!(batch.loaded.len(), 1);
    assert_eq!(batch.loaded[0].sender.as_str(), "C");
    assert_eq!(b.invoice_summary().await?, vec![(3, 30)]);
    Ok(())
}

#[tokio::test]
async fn test_loaded_packages_are_not_loaded_again() -> anyhow::Result<()> {
    let mesh = Mesh::builder(&["A", "B"]).build().await?;
    mesh.node("A").create_invoice(1, 10).await?;
    mesh.settle(5).await?;

    let batch = mesh.node("B").sync().await?.batch;
    assert!(batch.loaded.is_empty());
    assert!(batch.is_clean());
    Ok(())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever the arrival order, a package loads exactly when it is the
    /// next one in the sender's sequence.
    #[test]
    fn prop_only_the_next_package_loads(order in delivery_order(5)) {
        runtime().block_on(async {
            let mesh = Mesh::builder(&["A", "B"]).build().await.unwrap();
            let built = packages(mesh.node("A"), 5).await.unwrap();
            let b = mesh.node("B");
            let cancel = CancellationToken::new();

            let mut expected = 1u64;
            for &i in &order {
                let package = &built[i];
                let outcome = b
                    .engine()
                    .load(&package.name, package.bytes.clone(), &cancel, None)
                    .await
                    .unwrap();
                if package.name.seq == expected {
                    prop_assert!(outcome.is_success(), "{:?}", outcome);
                    expected += 1;
                } else {
                    prop_assert!(matches!(outcome, LoadOutcome::Rejected(_)), "{:?}", outcome);
                }
                let sender = b.node("A").await.unwrap().unwrap();
                prop_assert_eq!(sender.last_loaded_seq, expected - 1);
            }
            Ok(())
        })?;
    }

    /// Any edit script converges on the peer.
    #[test]
    fn prop_edit_scripts_converge(script in edit_script(10)) {
        runtime().block_on(async {
            let mesh = Mesh::builder(&["A", "B"]).build().await.unwrap();
            apply_script(mesh.node("A"), &script).await.unwrap();
            mesh.settle(6).await.unwrap();
            prop_assert_eq!(
                mesh.node("B").invoice_summary().await.unwrap(),
                mesh.node("A").invoice_summary().await.unwrap()
            );
            Ok(())
        })?;
    }
}
