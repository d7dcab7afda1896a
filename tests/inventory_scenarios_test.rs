mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use ledgerlink_core::{
    db::{BackendKind, Filter},
    models::{
        Axis, Component, EntityType, Item, ItemType, Measurements, PurchaseLine, PurchaseStatus, PurchaseType,
        Purchase, Relationship, RelationshipType,
    },
    services::{DerivedItemSpec, RelationshipAwareController},
    ServiceError,
};
use rstest::rstest;
use rust_decimal_macros::dec;
use serde_json::json;

use common::{line, sold, TestApp};

fn asset_line(name: &str) -> PurchaseLine {
    PurchaseLine {
        item: None,
        purchase_type: PurchaseType::Asset,
        asset_name: Some(name.into()),
        asset_category: Some("equipment".into()),
        ..PurchaseLine::inventory("", Axis::Quantity, 1.0, dec!(500))
    }
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn purchase_apply_adds_stock_and_takes_highest_unit_cost(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 10.0).await;

    let purchase = app
        .receive(vec![
            line(&a, Axis::Quantity, 3.0, dec!(5)),
            line(&a, Axis::Quantity, 2.0, dec!(7)),
        ])
        .await;

    assert!(purchase.inventory_applied);
    let a = app.stored_item(&a.id).await;
    assert_eq!(a.measurements.quantity, 15.0);
    assert_eq!(a.cost, dec!(7));
    assert_eq!(a.price, dec!(7));

    let edges = app.services.relationships.find_all_for_entity(&purchase.id).await.unwrap();
    assert_eq!(edges.as_primary.len(), 1);
    assert_eq!(edges.as_primary[0].relationship_type, RelationshipType::PurchaseItem);
    assert_eq!(edges.as_primary[0].measurements.quantity, 5.0);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn deleting_a_purchase_reverts_stock_but_not_pricing(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 10.0).await;
    let purchase = app
        .receive(vec![
            line(&a, Axis::Quantity, 3.0, dec!(5)),
            line(&a, Axis::Quantity, 2.0, dec!(7)),
        ])
        .await;

    assert!(app.services.purchases.delete(&purchase.id).await.unwrap());

    let a = app.stored_item(&a.id).await;
    assert_eq!(a.measurements.quantity, 10.0);
    assert_eq!(a.cost, dec!(7));
    let edges = app.services.relationships.find_all_for_entity(&a.id).await.unwrap();
    assert!(edges.as_secondary.is_empty());
    assert!(!app.services.purchases.delete(&purchase.id).await.unwrap());
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn sale_beyond_stock_clamps_at_zero(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let b = app.item("Bolt", Axis::Quantity, 2.0).await;

    let sale = app.sell(vec![sold(&b, Axis::Quantity, 5.0, dec!(1))]).await;

    assert!(sale.inventory_applied);
    assert_eq!(app.stock(&b.id, Axis::Quantity).await, 0.0);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn duplicate_relationship_is_a_conflict(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let item = app.item("Widget", Axis::Quantity, 0.0).await;
    let edge = Relationship::new(
        ("P1", EntityType::Purchase),
        (&item.id, EntityType::Item),
        RelationshipType::PurchaseItem,
    );

    app.services.relationships.create(edge.clone(), None).await.unwrap();
    let err = app.services.relationships.create(edge, None).await.unwrap_err();

    assert_matches!(err, ServiceError::Duplicate(_));
    assert_eq!(err.code(), "Conflict");
    assert_eq!(app.services.relationships.statistics().await.unwrap().total_count, 1);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn derivation_carves_children_out_of_the_source(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let mut source = Item::new("Steel sheet", Axis::Weight);
    source.measurements = Measurements::single(Axis::Weight, 10.0, Some("lb".into()));
    let source = app.services.items.create(source).await.unwrap();

    let result = app
        .services
        .derivation
        .create_derived_items(
            &source.id,
            vec![DerivedItemSpec::of(Axis::Weight, 4.0), DerivedItemSpec::of(Axis::Weight, 3.0)],
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.derived.len(), 2);
    let carved: Vec<Option<f64>> = result
        .derived
        .iter()
        .map(|child| child.derived_from.as_ref().and_then(|d| d.weight))
        .collect();
    assert_eq!(carved, vec![Some(4.0), Some(3.0)]);
    assert_eq!(result.derived[0].measurements.weight_unit.as_deref(), Some("lb"));
    assert_eq!(result.source.measurements.weight, 3.0);
    assert_eq!(app.stock(&source.id, Axis::Weight).await, 3.0);
    assert_eq!(result.source.derived_items.len(), 2);

    let edges = app.services.relationships.find_all_for_entity(&source.id).await.unwrap();
    let mut weights: Vec<f64> = edges
        .as_primary
        .iter()
        .filter(|e| e.relationship_type == RelationshipType::Derived)
        .map(|e| e.measurements.weight)
        .collect();
    weights.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(weights, vec![3.0, 4.0]);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn legacy_links_convert_once(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let p1 = app.item("Table", Axis::Quantity, 0.0).await;
    let p2 = app.item("Chair", Axis::Quantity, 0.0).await;
    let mut x = Item::new("Oak board", Axis::Quantity);
    x.used_in_products = vec![p1.id.clone(), p2.id.clone()];
    let x = app.services.items.create(x).await.unwrap();

    let first = app
        .services
        .relationships
        .convert_legacy_relationships(&x.id, EntityType::Item)
        .await
        .unwrap();
    assert_eq!((first.converted, first.skipped), (2, 0));

    let edges = app.services.relationships.find_all_for_entity(&x.id).await.unwrap();
    assert_eq!(edges.as_secondary.len(), 2);
    for edge in &edges.as_secondary {
        assert_eq!(edge.relationship_type, RelationshipType::ProductMaterial);
        assert!(edge.is_legacy);
        assert!([&p1.id, &p2.id].contains(&&edge.primary_id));
    }

    let second = app
        .services
        .relationships
        .convert_legacy_relationships(&x.id, EntityType::Item)
        .await
        .unwrap();
    assert_eq!((second.converted, second.skipped), (0, 2));
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn empty_purchase_commits_without_touching_stock(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let purchase = app.receive(Vec::new()).await;

    assert!(purchase.inventory_applied);
    let stored = app.services.repos.purchases.find_by_id(&purchase.id).await.unwrap();
    assert!(stored.is_some());
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn lines_without_a_known_item_are_skipped(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 1.0).await;
    let unreferenced = PurchaseLine {
        item: None,
        ..PurchaseLine::inventory("", Axis::Quantity, 2.0, dec!(1))
    };

    app.receive(vec![
        unreferenced,
        PurchaseLine::inventory("no-such-item", Axis::Quantity, 4.0, dec!(1)),
        line(&a, Axis::Quantity, 1.0, dec!(3)),
    ])
    .await;

    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 2.0);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn asset_lines_record_assets_instead_of_stock(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 0.0).await;
    let purchase = app
        .receive(vec![line(&a, Axis::Quantity, 4.0, dec!(2)), asset_line("Laser cutter")])
        .await;

    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 4.0);
    let asset_id = purchase.items[1].asset.clone().expect("asset recorded on the line");
    let asset = app.services.repos.assets.find_by_id(&asset_id).await.unwrap().unwrap();
    assert_eq!(asset.name, "Laser cutter");
    assert_eq!(asset.acquisition_cost, dec!(500));
    assert_eq!(asset.source_purchase.as_deref(), Some(purchase.id.as_str()));
    assert!(asset.asset_tag.as_deref().is_some_and(|tag| tag.starts_with("AST-")));

    let edges = app.services.relationships.find_all_for_entity(&purchase.id).await.unwrap();
    let mut types: Vec<RelationshipType> = edges.as_primary.iter().map(|e| e.relationship_type).collect();
    types.sort();
    assert_eq!(types, vec![RelationshipType::PurchaseItem, RelationshipType::PurchaseAsset]);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn deleting_an_asset_removes_its_purchase_edge(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 0.0).await;
    let purchase = app
        .receive(vec![line(&a, Axis::Quantity, 1.0, dec!(2)), asset_line("Forklift")])
        .await;
    let asset_id = purchase.items[1].asset.clone().unwrap();

    let (status, _) = app
        .request(Method::DELETE, &format!("/api/assets/{}", asset_id), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let edges = app.services.relationships.find_all_for_entity(&asset_id).await.unwrap();
    assert!(edges.as_primary.is_empty());
    assert!(edges.as_secondary.is_empty());
    let edges = app.services.relationships.find_all_for_entity(&purchase.id).await.unwrap();
    assert_eq!(edges.as_primary.len(), 1);
    assert_eq!(edges.as_primary[0].relationship_type, RelationshipType::PurchaseItem);
    assert!(app.services.repos.assets.find_by_id(&asset_id).await.unwrap().is_none());

    let (status, _) = app
        .request(Method::DELETE, &format!("/api/assets/{}", asset_id), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn removing_an_asset_line_deletes_its_asset(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 0.0).await;
    let purchase = app
        .receive(vec![line(&a, Axis::Quantity, 4.0, dec!(2)), asset_line("Laser cutter")])
        .await;

    let updated = app
        .services
        .purchases
        .update(&purchase.id, json!({"items": [purchase.items[0].clone()]}))
        .await
        .unwrap();

    assert_eq!(updated.items.len(), 1);
    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 4.0);
    assert_eq!(app.services.repos.assets.count(&Filter::all()).await.unwrap(), 0);
    let edges = app.services.relationships.find_all_for_entity(&purchase.id).await.unwrap();
    let types: Vec<RelationshipType> = edges.as_primary.iter().map(|e| e.relationship_type).collect();
    assert_eq!(types, vec![RelationshipType::PurchaseItem]);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn resubmitted_asset_lines_keep_their_asset(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 0.0).await;
    let purchase = app
        .receive(vec![line(&a, Axis::Quantity, 4.0, dec!(2)), asset_line("Laser cutter")])
        .await;
    let asset_id = purchase.items[1].asset.clone().unwrap();

    let updated = app
        .services
        .purchases
        .update(
            &purchase.id,
            json!({"items": [purchase.items[0].clone(), asset_line("Laser cutter")]}),
        )
        .await
        .unwrap();

    assert_eq!(updated.items[1].asset.as_deref(), Some(asset_id.as_str()));
    assert_eq!(app.services.repos.assets.count(&Filter::all()).await.unwrap(), 1);
    let edges = app.services.relationships.find_all_for_entity(&asset_id).await.unwrap();
    assert_eq!(edges.as_secondary.len(), 1);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn deleting_a_component_removes_edges_on_both_sides(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let material = app.item("Screw", Axis::Quantity, 100.0).await;
    let mut product = Item::new("Shelf", Axis::Quantity);
    product.item_type = ItemType::Product;
    product.components = vec![Component {
        item: material.id.clone(),
        quantity: 8.0,
    }];
    let product = app.services.items.create(product).await.unwrap();

    let before = app.services.relationships.find_all_for_entity(&product.id).await.unwrap();
    assert_eq!(before.as_primary.len(), 1);

    assert!(app.services.items.delete(&material.id).await.unwrap());

    let product_edges = app.services.relationships.find_all_for_entity(&product.id).await.unwrap();
    assert!(product_edges.as_primary.is_empty());
    let material_edges = app.services.relationships.find_all_for_entity(&material.id).await.unwrap();
    assert!(material_edges.as_secondary.is_empty());
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn derivation_one_ulp_over_the_source_fails_cleanly(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let source = app
        .services
        .items
        .create(Item::new("Rope", Axis::Length).with_measurement(Axis::Length, 10.0))
        .await
        .unwrap();
    let just_over = f64::from_bits(10.0f64.to_bits() + 1);

    let err = app
        .services
        .derivation
        .create_derived_items(&source.id, vec![DerivedItemSpec::of(Axis::Length, just_over)], None)
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InsufficientSource { axis: Axis::Length, .. });
    assert_eq!(app.stock(&source.id, Axis::Length).await, 10.0);
    let edges = app.services.relationships.find_all_for_entity(&source.id).await.unwrap();
    assert!(edges.as_primary.is_empty());
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn fractional_carves_that_sum_to_the_source_succeed(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let resin = app.item("Resin", Axis::Volume, 0.3).await;

    let result = app
        .services
        .derivation
        .create_derived_items(
            &resin.id,
            vec![DerivedItemSpec::of(Axis::Volume, 0.1), DerivedItemSpec::of(Axis::Volume, 0.2)],
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.derived.len(), 2);
    assert_eq!(app.stock(&resin.id, Axis::Volume).await, 0.0);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn status_transitions_apply_and_revert_purchases(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Widget", Axis::Quantity, 1.0).await;
    let pending = app
        .services
        .purchases
        .create(Purchase::new(
            "Acme Supply",
            PurchaseStatus::Pending,
            vec![line(&a, Axis::Quantity, 4.0, dec!(2))],
        ))
        .await
        .unwrap();
    assert!(!pending.inventory_applied);
    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 1.0);

    let received = app
        .services
        .purchases
        .update(&pending.id, json!({"status": "received"}))
        .await
        .unwrap();
    assert!(received.inventory_applied);
    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 5.0);

    let cancelled = app
        .services
        .purchases
        .update(&pending.id, json!({"status": "cancelled", "inventoryApplied": true}))
        .await
        .unwrap();
    assert!(!cancelled.inventory_applied);
    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 1.0);
}

#[rstest]
#[case::document_store(BackendKind::DocumentStore)]
#[case::key_value(BackendKind::KeyValue)]
#[case::other_doc(BackendKind::OtherDoc)]
#[tokio::test]
async fn editing_sale_lines_moves_stock_and_edges(#[case] kind: BackendKind) {
    let app = TestApp::new(kind).await;
    let a = app.item("Apple", Axis::Quantity, 10.0).await;
    let b = app.item("Banana", Axis::Quantity, 10.0).await;
    let sale = app.sell(vec![sold(&a, Axis::Quantity, 3.0, dec!(1))]).await;
    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 7.0);

    let lines = vec![sold(&b, Axis::Quantity, 2.0, dec!(1))];
    let updated = app
        .services
        .sales
        .update(
            &sale.id,
            json!({"items": lines, "subtotal": 2, "total": 2}),
        )
        .await
        .unwrap();

    assert_eq!(updated.items.len(), 1);
    assert_eq!(app.stock(&a.id, Axis::Quantity).await, 10.0);
    assert_eq!(app.stock(&b.id, Axis::Quantity).await, 8.0);
    let edges = app.services.relationships.find_all_for_entity(&sale.id).await.unwrap();
    assert_eq!(edges.as_primary.len(), 1);
    assert_eq!(edges.as_primary[0].secondary_id, b.id);

    let refunded = app
        .services
        .sales
        .update(&sale.id, json!({"status": "refunded"}))
        .await
        .unwrap();
    assert!(!refunded.inventory_applied);
    assert_eq!(app.stock(&b.id, Axis::Quantity).await, 10.0);
}

#[tokio::test]
async fn weight_tracked_items_sold_by_count_draw_down_quantity() {
    let app = TestApp::new(BackendKind::OtherDoc).await;
    let cheese = app
        .services
        .items
        .create(
            Item::new("Cheese wheel", Axis::Weight)
                .with_measurement(Axis::Weight, 20.0)
                .with_measurement(Axis::Quantity, 4.0),
        )
        .await
        .unwrap();

    app.sell(vec![sold(&cheese, Axis::Quantity, 1.0, dec!(30))]).await;

    let stored = app.stored_item(&cheese.id).await;
    assert_eq!(stored.measurements.weight, 20.0);
    assert_eq!(stored.measurements.quantity, 3.0);
}

#[tokio::test]
async fn rebuild_restores_missing_edges_only() {
    let app = TestApp::new(BackendKind::OtherDoc).await;
    let a = app.item("Widget", Axis::Quantity, 0.0).await;
    let purchase = app.receive(vec![line(&a, Axis::Quantity, 2.0, dec!(1))]).await;
    let sale = app.sell(vec![sold(&a, Axis::Quantity, 1.0, dec!(3))]).await;

    let sale_edge = app.services.relationships.find_direct_relationships(&sale.id, &a.id).await.unwrap();
    assert_eq!(sale_edge.len(), 1);
    app.services
        .repos
        .relationships
        .delete(&sale_edge[0].id, None)
        .await
        .unwrap();

    let report = app.services.relationships.rebuild_relationships().await.unwrap();
    assert_eq!(report.created, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(
        app.services.relationships.find_direct_relationships(&sale.id, &a.id).await.unwrap().len(),
        1
    );
    assert_eq!(
        app.services.relationships.find_direct_relationships(&purchase.id, &a.id).await.unwrap().len(),
        1
    );

    let again = app.services.relationships.rebuild_relationships().await.unwrap();
    assert_eq!(again.created, 0);
}
