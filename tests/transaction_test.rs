mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use ledgerlink_core::{
    db::{current_transaction, BackendKind, StorageBackend, TransactionOptions},
    models::{Asset, Axis, EntityType, Relationship, RelationshipType, Sale, SaleStatus},
    services::{relationships::purchase_item_edges, EdgeDiff, EdgeKind, RelationshipAwareController},
    ServiceError,
};
use rstest::rstest;
use rust_decimal_macros::dec;
use serde_json::json;

use common::{line, sold, TestApp};

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn failure_inside_a_scope_leaves_the_store_untouched(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 10.0).await;
    let before = app.stored_item(&a.id).await;

    let inventory = app.services.inventory.clone();
    let assets = app.services.repos.assets.clone();
    let lines = vec![line(&a, Axis::Quantity, 5.0, dec!(3))];
    let result: Result<(), ServiceError> = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::labeled("test.atomicity"), |txn| {
            let inventory = inventory.clone();
            let assets = assets.clone();
            let lines = lines.clone();
            async move {
                inventory.apply_purchase(&lines, &txn).await?;
                assets.create(Asset::new("Forklift"), Some(&txn)).await?;
                Err(ServiceError::ValidationError("abort".into()))
            }
        })
        .await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert_eq!(app.stored_item(&a.id).await, before);
    let assets = app.services.repos.assets.find_all(&Default::default(), &Default::default()).await.unwrap();
    assert!(assets.is_empty());
}

#[tokio::test]
async fn failed_compensation_surfaces_as_partial_rollback() {
    let app = TestApp::new(BackendKind::OtherDoc).await;
    let client = app.doc_client.clone().unwrap();
    let assets = app.services.repos.assets.clone();

    let result: Result<(), ServiceError> = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::labeled("test.partial"), |txn| {
            let assets = assets.clone();
            let client = client.clone();
            async move {
                assets.create(Asset::new("Forklift"), Some(&txn)).await?;
                client.set_available(false);
                Err(ServiceError::ValidationError("abort".into()))
            }
        })
        .await;

    assert_matches!(result, Err(ServiceError::PartialRollback(_)));
    app.doc_client.as_ref().unwrap().set_available(true);
}

#[tokio::test]
async fn oversized_key_value_batches_are_refused_whole() {
    let app = TestApp::new(BackendKind::KeyValue).await;
    let relationships = app.services.repos.relationships.clone();

    let result: Result<(), ServiceError> = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::labeled("test.too_large"), |txn| {
            let relationships = relationships.clone();
            async move {
                for n in 0..120 {
                    let purchase_id = format!("P{}", n);
                    let edge = Relationship::new(
                        (purchase_id.as_str(), EntityType::Purchase),
                        ("I1", EntityType::Item),
                        RelationshipType::PurchaseItem,
                    );
                    relationships.create(edge, Some(&txn)).await?;
                }
                Ok(())
            }
        })
        .await;

    assert_matches!(result, Err(ServiceError::TransactionTooLarge { limit: 100, .. }));
    assert_eq!(app.services.relationships.statistics().await.unwrap().total_count, 0);
}

#[tokio::test]
async fn nested_scopes_join_the_outer_transaction() {
    let app = TestApp::new(BackendKind::DocumentStore).await;
    let coordinator = app.services.coordinator.clone();

    let (outer, inner) = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::labeled("outer"), |txn| {
            let coordinator = coordinator.clone();
            async move {
                let inner = coordinator
                    .with_transaction(TransactionOptions::labeled("inner"), |nested| async move { Ok(nested.id()) })
                    .await?;
                Ok((txn.id(), inner))
            }
        })
        .await
        .unwrap();

    assert_eq!(outer, inner);
    assert!(current_transaction().is_none());
}

#[tokio::test]
async fn conflicts_are_retried_until_the_scope_succeeds() {
    let app = TestApp::new(BackendKind::OtherDoc).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let value = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::retrying("test.retry"), move |_txn| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServiceError::Conflict("lost update".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retries_give_up_after_the_schedule() {
    let app = TestApp::new(BackendKind::OtherDoc).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let result: Result<(), ServiceError> = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::retrying("test.exhausted"), move |_txn| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Conflict("lost update".into()))
            }
        })
        .await;

    assert_matches!(result, Err(ServiceError::Conflict(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn duplicates_fail_on_the_first_attempt(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let edge = Relationship::new(
        ("P1", EntityType::Purchase),
        ("I1", EntityType::Item),
        RelationshipType::PurchaseItem,
    );
    app.services.repos.relationships.create(edge.clone(), None).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let relationships = app.services.repos.relationships.clone();
    let result = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::retrying("test.duplicate"), move |txn| {
            let counter = counter.clone();
            let relationships = relationships.clone();
            let edge = edge.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                relationships.create(edge, Some(&txn)).await
            }
        })
        .await;

    let err = result.unwrap_err();
    assert_matches!(err, ServiceError::Duplicate(_));
    assert_eq!(err.code(), "Conflict");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(app.services.relationships.statistics().await.unwrap().total_count, 1);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn edge_diff_is_idempotent(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 0.0).await;
    let b = app.item("Gadget", Axis::Quantity, 0.0).await;
    let purchase = app
        .receive(vec![
            line(&a, Axis::Quantity, 2.0, dec!(1)),
            line(&b, Axis::Quantity, 3.0, dec!(4)),
        ])
        .await;
    let edges_of = |id: String| {
        let relationships = app.services.relationships.clone();
        async move {
            let mut edges = relationships.find_all_for_entity(&id).await.unwrap().as_primary;
            edges.sort_by(|x, y| x.id.cmp(&y.id));
            edges
        }
    };
    let before = edges_of(purchase.id.clone()).await;
    assert_eq!(before.len(), 2);

    for _ in 0..2 {
        let relationships = app.services.relationships.clone();
        let purchase = purchase.clone();
        let diff = app
            .services
            .coordinator
            .with_transaction(TransactionOptions::labeled("test.edge_diff"), move |txn| {
                let relationships = relationships.clone();
                let purchase = purchase.clone();
                async move {
                    relationships
                        .update_relationships(
                            EdgeKind::PURCHASE_ITEM,
                            &purchase.id,
                            &purchase.item_ids(),
                            &purchase_item_edges(&purchase),
                            &txn,
                        )
                        .await
                }
            })
            .await
            .unwrap();
        assert_eq!(diff, EdgeDiff::default());
    }

    assert_eq!(edges_of(purchase.id.clone()).await, before);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn concurrent_sales_of_one_item_both_land(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 10.0).await;
    let sell = |amount: f64| {
        app.services.sales.create(Sale::new(
            "Walk-in",
            SaleStatus::Completed,
            vec![sold(&a, Axis::Quantity, amount, dec!(2))],
        ))
    };

    let (first, second) = tokio::join!(sell(3.0), sell(4.0));
    first.unwrap();
    second.unwrap();

    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 3.0);
    let edges = app.services.relationships.find_all_for_entity(&a.id).await.unwrap();
    assert_eq!(edges.as_secondary.len(), 2);
}

#[rstest]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn writes_over_a_stale_read_conflict_and_retry(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 10.0).await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let items = app.services.repos.items.clone();
    let sales = app.services.sales.clone();
    let id = a.id.clone();
    app.services
        .coordinator
        .with_transaction(TransactionOptions::retrying("test.stale_read"), move |txn| {
            let counter = counter.clone();
            let items = items.clone();
            let sales = sales.clone();
            let id = id.clone();
            async move {
                let item = items.find_by_id_in(&id, Some(&txn)).await?.unwrap();
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    // A sale commits from another task between the read and the write.
                    let sale = Sale::new(
                        "Walk-in",
                        SaleStatus::Completed,
                        vec![sold(&item, Axis::Quantity, 4.0, dec!(2))],
                    );
                    tokio::spawn(async move { sales.create(sale).await }).await.unwrap()?;
                }
                let remaining = item.measurements.quantity - 3.0;
                items.update(&id, json!({"quantity": remaining}), Some(&txn)).await
            }
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 3.0);
}

#[tokio::test]
async fn non_retrying_scopes_run_once() {
    let app = TestApp::new(BackendKind::OtherDoc).await;
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let result: Result<(), ServiceError> = app
        .services
        .coordinator
        .with_transaction(TransactionOptions::labeled("test.no_retry"), move |_txn| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::Conflict("lost update".into()))
            }
        })
        .await;

    assert!(result.unwrap_err().is_conflict());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn finished_handles_are_rejected() {
    let app = TestApp::new(BackendKind::DocumentStore).await;
    let handle = app.backend.begin().await.unwrap();
    app.backend.commit(&handle).await.unwrap();

    let err = app
        .services
        .derivation
        .create_derived_items("anything", Vec::new(), Some(&handle))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::TransactionRequired(_));
}

#[tokio::test]
async fn explicit_handles_are_joined_and_committed_by_their_owner() {
    let app = TestApp::new(BackendKind::DocumentStore).await;
    let source = app.item("Plank", Axis::Length, 8.0).await;
    let handle = app.backend.begin().await.unwrap();

    app.services
        .derivation
        .create_derived_items(
            &source.id,
            vec![ledgerlink_core::services::DerivedItemSpec::of(Axis::Length, 2.0)],
            Some(&handle),
        )
        .await
        .unwrap();
    assert!(app.backend.is_active(&handle));

    app.backend.commit(&handle).await.unwrap();
    assert_eq!(app.stock(&source.id, Axis::Length).await, 6.0);
}

#[tokio::test]
async fn unrelated_writes_outside_a_scope_are_kept() {
    let app = TestApp::new(BackendKind::KeyValue).await;
    let a = app.item("Widget", Axis::Quantity, 1.0).await;

    app.services
        .repos
        .items
        .update(&a.id, json!({"category": "tools"}), None)
        .await
        .unwrap();

    assert_eq!(app.stored_item(&a.id).await.category.as_deref(), Some("tools"));
}
