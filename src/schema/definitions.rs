//! Declarations for every persisted entity.

use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Map, Value};
use tracing::debug;
use validator::Validate;

use super::{EntitySchema, FieldDef, FieldType};
use crate::errors::ServiceError;
use crate::models::{
    is_valid_entity_combination, EntityType, Item, Purchase, Relationship, Sale,
};

const AXES: &[&str] = &["quantity", "weight", "length", "area", "volume"];
const ITEM_TYPES: &[&str] = &["material", "product", "both"];
const PURCHASE_STATUSES: &[&str] = &["pending", "received", "partially_received", "cancelled"];
const SALE_STATUSES: &[&str] = &["completed", "refunded", "partially_refunded"];
const ENTITY_TYPES: &[&str] = &["Item", "Purchase", "Sale", "Asset"];
const RELATIONSHIP_TYPES: &[&str] = &[
    "purchase_item",
    "purchase_asset",
    "sale_item",
    "product_material",
    "derived",
    "parent_child",
    "associated",
];

/// Totals may drift by rounding on the client.
const TOTAL_TOLERANCE: Decimal = dec!(0.005);

pub const UNIQUE_CONSTRAINTS_COLLECTION: &str = "unique_constraints";

pub static ITEM_SCHEMA: Lazy<EntitySchema> = Lazy::new(|| {
    let schema = EntitySchema::new("items")
        .entity(EntityType::Item)
        .field(FieldDef::string("name").required().validator(not_blank))
        .field(FieldDef::string("sku"))
        .field(FieldDef::string("category"))
        .field(FieldDef::new("tags", FieldType::Array).default_value(json!([])))
        .field(
            FieldDef::string("itemType")
                .one_of(ITEM_TYPES)
                .default_value(json!("material")),
        )
        .field(
            FieldDef::string("trackingType")
                .one_of(AXES)
                .default_value(json!("quantity")),
        );

    measurement_fields(schema)
        .field(FieldDef::number("cost").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("price").min(0.0).default_value(json!(0)))
        .field(FieldDef::string("imageUrl"))
        .field(FieldDef::new("components", FieldType::Array).default_value(json!([])))
        .field(FieldDef::new("usedInProducts", FieldType::Array).default_value(json!([])))
        .field(FieldDef::new("relatedItems", FieldType::Array).default_value(json!([])))
        .field(FieldDef::new("derivedFrom", FieldType::Object).references(EntityType::Item))
        .field(FieldDef::new("derivedItems", FieldType::Array).default_value(json!([])))
        .field(FieldDef::new("createdAt", FieldType::Date).required())
        .field(FieldDef::new("updatedAt", FieldType::Date).required())
        .field(FieldDef::new("lastUpdated", FieldType::Date))
        .index("CategoryIndex", "category")
        .index("CreatedAtIndex", "createdAt")
        .unique(&["sku"])
        .searchable(&["name", "sku", "category", "tags"])
        .sequence("sku", "sku", |n| format!("{:06}", n))
        .validate_with(validate_item)
        .pre_save(trim_name)
        .post_save(log_saved)
});

pub static PURCHASE_SCHEMA: Lazy<EntitySchema> = Lazy::new(|| {
    EntitySchema::new("purchases")
        .entity(EntityType::Purchase)
        .field(FieldDef::new("supplier", FieldType::Object).required())
        .field(FieldDef::string("invoiceNumber"))
        .field(FieldDef::new("purchaseDate", FieldType::Date).required())
        .field(FieldDef::new("items", FieldType::Array).default_value(json!([])))
        .field(FieldDef::number("subtotal").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("taxRate").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("taxAmount").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("shippingCost").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("total").min(0.0).default_value(json!(0)))
        .field(FieldDef::string("paymentMethod"))
        .field(
            FieldDef::string("status")
                .one_of(PURCHASE_STATUSES)
                .default_value(json!("pending")),
        )
        .field(
            FieldDef::new("inventoryApplied", FieldType::Boolean).default_value(json!(false)),
        )
        .field(FieldDef::new("createdAt", FieldType::Date).required())
        .field(FieldDef::new("updatedAt", FieldType::Date).required())
        .index("SupplierNameIndex", "supplier.name")
        .index("PurchaseDateIndex", "purchaseDate")
        .searchable(&["supplier.name", "invoiceNumber", "notes"])
        .validate_with(validate_purchase)
        .post_save(log_saved)
});

pub static SALE_SCHEMA: Lazy<EntitySchema> = Lazy::new(|| {
    EntitySchema::new("sales")
        .entity(EntityType::Sale)
        .field(FieldDef::new("customer", FieldType::Object).required())
        .field(FieldDef::string("invoiceNumber"))
        .field(FieldDef::new("saleDate", FieldType::Date).required())
        .field(FieldDef::new("items", FieldType::Array).default_value(json!([])))
        .field(FieldDef::number("subtotal").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("taxRate").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("taxAmount").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("shippingCost").min(0.0).default_value(json!(0)))
        .field(FieldDef::number("total").min(0.0).default_value(json!(0)))
        .field(FieldDef::string("paymentMethod"))
        .field(
            FieldDef::string("status")
                .one_of(SALE_STATUSES)
                .default_value(json!("completed")),
        )
        .field(
            FieldDef::new("inventoryApplied", FieldType::Boolean).default_value(json!(false)),
        )
        .field(FieldDef::new("createdAt", FieldType::Date).required())
        .field(FieldDef::new("updatedAt", FieldType::Date).required())
        .index("CustomerEmailIndex", "customer.email")
        .index("CreatedAtIndex", "createdAt")
        .searchable(&["customer.name", "customer.email", "invoiceNumber", "notes"])
        .validate_with(validate_sale)
        .post_save(log_saved)
});

pub static ASSET_SCHEMA: Lazy<EntitySchema> = Lazy::new(|| {
    EntitySchema::new("assets")
        .entity(EntityType::Asset)
        .field(FieldDef::string("name").required().validator(not_blank))
        .field(FieldDef::string("assetTag"))
        .field(FieldDef::string("category"))
        .field(FieldDef::string("location"))
        .field(FieldDef::number("acquisitionCost").min(0.0).default_value(json!(0)))
        .field(FieldDef::new("acquisitionDate", FieldType::Date))
        .field(FieldDef::new("maintenanceRecords", FieldType::Array).default_value(json!([])))
        .field(FieldDef::string("imageUrl"))
        .field(FieldDef::string("sourcePurchase").references(EntityType::Purchase))
        .field(FieldDef::new("createdAt", FieldType::Date).required())
        .field(FieldDef::new("updatedAt", FieldType::Date).required())
        .index("CategoryIndex", "category")
        .unique(&["assetTag"])
        .searchable(&["name", "assetTag", "category", "location"])
        .sequence("assetTag", "asset", |n| format!("AST-{:06}", n))
        .pre_save(trim_name)
        .post_save(log_saved)
});

pub static RELATIONSHIP_SCHEMA: Lazy<EntitySchema> = Lazy::new(|| {
    EntitySchema::new("relationships")
        .field(FieldDef::string("primaryId").required().validator(not_blank))
        .field(FieldDef::string("primaryType").required().one_of(ENTITY_TYPES))
        .field(FieldDef::string("secondaryId").required().validator(not_blank))
        .field(FieldDef::string("secondaryType").required().one_of(ENTITY_TYPES))
        .field(
            FieldDef::string("relationshipType")
                .required()
                .one_of(RELATIONSHIP_TYPES),
        )
        .field(FieldDef::new("measurements", FieldType::Object).default_value(json!({})))
        .field(FieldDef::new("metadata", FieldType::Object).default_value(json!({})))
        .field(FieldDef::new("isLegacy", FieldType::Boolean).default_value(json!(false)))
        .field(FieldDef::new("createdAt", FieldType::Date).required())
        .field(FieldDef::new("updatedAt", FieldType::Date).required())
        .index("PrimaryIndex", "primaryId")
        .index("SecondaryIndex", "secondaryId")
        .unique(&[
            "primaryId",
            "primaryType",
            "secondaryId",
            "secondaryType",
            "relationshipType",
        ])
        .searchable(&["notes", "relationshipType"])
        .validate_with(validate_relationship)
});

pub static COUNTER_SCHEMA: Lazy<EntitySchema> = Lazy::new(|| {
    EntitySchema::new("counters").field(
        FieldDef::new("value", FieldType::Integer)
            .required()
            .min(0.0),
    )
});

fn measurement_fields(schema: EntitySchema) -> EntitySchema {
    let mut schema = schema;
    for axis in AXES {
        schema = schema.field(FieldDef::number(axis).min(0.0).default_value(json!(0)));
    }
    schema
        .field(FieldDef::string("weightUnit"))
        .field(FieldDef::string("lengthUnit"))
        .field(FieldDef::string("areaUnit"))
        .field(FieldDef::string("volumeUnit"))
}

fn not_blank(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err("must not be blank".to_string()),
    }
}

fn trim_name(doc: &mut Map<String, Value>) {
    if let Some(Value::String(name)) = doc.get_mut("name") {
        let trimmed = name.trim();
        if trimmed.len() != name.len() {
            *name = trimmed.to_string();
        }
    }
}

fn log_saved(doc: &Value) {
    let id = doc.get("id").and_then(|v| v.as_str()).unwrap_or_default();
    debug!(id, "record saved");
}

fn decode<T: serde::de::DeserializeOwned>(doc: &Value, what: &str) -> Result<T, ServiceError> {
    serde_json::from_value(doc.clone())
        .map_err(|e| ServiceError::ValidationError(format!("invalid {}: {}", what, e)))
}

fn validate_item(doc: &Value) -> Result<(), ServiceError> {
    let item: Item = decode(doc, "item")?;

    if item.item_type.has_components() == item.components.is_empty() {
        return Err(ServiceError::ValidationError(if item.components.is_empty() {
            format!("{} items require at least one component", item.item_type)
        } else {
            "only product items may list components".to_string()
        }));
    }

    if item.components.iter().any(|c| c.item.trim().is_empty()) {
        return Err(ServiceError::ValidationError(
            "component references must not be blank".into(),
        ));
    }
    Ok(())
}

fn check_total(
    subtotal: Decimal,
    tax_amount: Decimal,
    shipping_cost: Decimal,
    total: Decimal,
) -> Result<(), ServiceError> {
    let expected = subtotal + tax_amount + shipping_cost;
    if (expected - total).abs() > TOTAL_TOLERANCE {
        return Err(ServiceError::ValidationError(format!(
            "total {} does not equal subtotal + taxAmount + shippingCost ({})",
            total, expected
        )));
    }
    Ok(())
}

fn validate_purchase(doc: &Value) -> Result<(), ServiceError> {
    let purchase: Purchase = decode(doc, "purchase")?;
    purchase.validate()?;
    check_total(
        purchase.subtotal,
        purchase.tax_amount,
        purchase.shipping_cost,
        purchase.total,
    )?;

    for (index, line) in purchase.items.iter().enumerate() {
        if line.measurements.get(line.purchased_by) <= 0.0 {
            return Err(ServiceError::ValidationError(format!(
                "line {} must carry a positive {} (purchasedBy)",
                index, line.purchased_by
            )));
        }
        if line.cost_per_unit.is_sign_negative() || line.total_cost.is_sign_negative() {
            return Err(ServiceError::ValidationError(format!(
                "line {} has a negative cost",
                index
            )));
        }
    }
    Ok(())
}

fn validate_sale(doc: &Value) -> Result<(), ServiceError> {
    let sale: Sale = decode(doc, "sale")?;
    sale.validate()?;
    check_total(sale.subtotal, sale.tax_amount, sale.shipping_cost, sale.total)?;

    for (index, line) in sale.items.iter().enumerate() {
        let m = &line.measurements;
        if [m.quantity, m.weight, m.length, m.area, m.volume]
            .iter()
            .any(|v| *v < 0.0)
        {
            return Err(ServiceError::ValidationError(format!(
                "line {} has a negative measurement",
                index
            )));
        }
    }
    Ok(())
}

fn validate_relationship(doc: &Value) -> Result<(), ServiceError> {
    let rel: Relationship = decode(doc, "relationship")?;
    if !is_valid_entity_combination(rel.relationship_type, rel.primary_type, rel.secondary_type) {
        return Err(ServiceError::InvalidRelationshipCombination {
            relationship_type: rel.relationship_type,
            primary_type: rel.primary_type,
            secondary_type: rel.secondary_type,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Axis, Component, ItemType, PurchaseLine, PurchaseStatus, RelationshipType};
    use assert_matches::assert_matches;

    fn prepared<T: serde::Serialize>(schema: &EntitySchema, record: &T) -> Value {
        let mut doc = serde_json::to_value(record).unwrap();
        schema.apply_defaults(doc.as_object_mut().unwrap());
        doc
    }

    #[test]
    fn products_need_components() {
        let mut item = Item::new("Table", Axis::Quantity);
        item.item_type = ItemType::Product;
        let err = ITEM_SCHEMA.validate(&prepared(&ITEM_SCHEMA, &item)).unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));

        item.components.push(Component {
            item: "leg".into(),
            quantity: 4.0,
        });
        assert!(ITEM_SCHEMA.validate(&prepared(&ITEM_SCHEMA, &item)).is_ok());
    }

    #[test]
    fn negative_authoritative_measurement_is_rejected() {
        let item = Item::new("Rope", Axis::Length).with_measurement(Axis::Length, -1.0);
        assert!(ITEM_SCHEMA.validate(&prepared(&ITEM_SCHEMA, &item)).is_err());
    }

    #[test]
    fn purchase_total_must_add_up() {
        let mut purchase = Purchase::new(
            "Acme",
            PurchaseStatus::Received,
            vec![PurchaseLine::inventory("a", Axis::Quantity, 3.0, dec!(5))],
        );
        assert!(PURCHASE_SCHEMA
            .validate(&prepared(&PURCHASE_SCHEMA, &purchase))
            .is_ok());

        purchase.total = dec!(16);
        assert!(PURCHASE_SCHEMA
            .validate(&prepared(&PURCHASE_SCHEMA, &purchase))
            .is_err());

        purchase.total = dec!(15.004);
        assert!(PURCHASE_SCHEMA
            .validate(&prepared(&PURCHASE_SCHEMA, &purchase))
            .is_ok());
    }

    #[test]
    fn purchase_line_needs_its_purchased_by_measurement() {
        let mut line = PurchaseLine::inventory("a", Axis::Quantity, 3.0, dec!(5));
        line.purchased_by = Axis::Weight;
        let purchase = Purchase::new("Acme", PurchaseStatus::Pending, vec![line]);
        let err = PURCHASE_SCHEMA
            .validate(&prepared(&PURCHASE_SCHEMA, &purchase))
            .unwrap_err();
        assert!(err.to_string().contains("purchasedBy"));
    }

    #[test]
    fn invalid_relationship_combination_is_its_own_error() {
        let rel = Relationship::new(
            ("i1", EntityType::Item),
            ("p1", EntityType::Purchase),
            RelationshipType::PurchaseItem,
        );
        let err = RELATIONSHIP_SCHEMA
            .validate(&prepared(&RELATIONSHIP_SCHEMA, &rel))
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidRelationshipCombination { .. });
        assert!(err.is_validation());
    }

    #[test]
    fn sequences_format_codes() {
        let sku = ITEM_SCHEMA.sequence.as_ref().unwrap();
        assert_eq!((sku.format)(42), "000042");
        let tag = ASSET_SCHEMA.sequence.as_ref().unwrap();
        assert_eq!((tag.format)(1), "AST-000001");
    }
}
