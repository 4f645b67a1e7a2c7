use anyhow::{bail, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::OrderAction;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub brand: String,
    pub base_price: BigDecimal,
    pub has_variants: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::variants)]
pub struct Variant {
    pub id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub price: Option<BigDecimal>,
    pub stock_quantity: i32,
    pub is_active: bool,
}

impl Variant {
    /// Variant price when set, otherwise the parent product's base price.
    pub fn effective_price(&self, base_price: &BigDecimal) -> BigDecimal {
        self.price.clone().unwrap_or_else(|| base_price.clone())
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub status: String,
    pub payment_status: String,
    pub user_email: String,
    pub subtotal: BigDecimal,
    pub shipping_cost: BigDecimal,
    pub tax: BigDecimal,
    pub discount: BigDecimal,
    pub total: BigDecimal,
    pub inventory_applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// `total = subtotal + shipping_cost + tax - discount`, fixed at creation.
    pub fn totals_consistent(&self) -> bool {
        self.total == &self.subtotal + &self.shipping_cost + &self.tax - &self.discount
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_items)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub product_name: String,
    pub sku: String,
    pub unit_price: BigDecimal,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Result<Self> {
        let status = match s {
            "pending" => OrderStatus::Pending,
            "confirmed" => OrderStatus::Confirmed,
            "processing" => OrderStatus::Processing,
            "shipped" => OrderStatus::Shipped,
            "delivered" => OrderStatus::Delivered,
            "cancelled" => OrderStatus::Cancelled,
            "refunded" => OrderStatus::Refunded,
            other => bail!("unknown order status: {}", other),
        };
        Ok(status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// True until the order leaves the warehouse; cancellation is only
    /// valid from these states.
    pub fn pre_shipment(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Processing
        )
    }

    /// Evaluates one lifecycle action against the current status. The
    /// machine only moves forward; re-applying an already-satisfied action
    /// is a no-op so duplicate deliveries stay harmless.
    pub fn apply(&self, action: OrderAction) -> Transition {
        match action {
            OrderAction::Confirm => match self {
                OrderStatus::Pending => Transition::Apply(OrderStatus::Confirmed),
                OrderStatus::Confirmed => Transition::NoOp,
                _ => Transition::Rejected,
            },
            OrderAction::Ship => match self {
                s if s.pre_shipment() => Transition::Apply(OrderStatus::Shipped),
                OrderStatus::Shipped => Transition::NoOp,
                _ => Transition::Rejected,
            },
            OrderAction::Deliver => match self {
                OrderStatus::Shipped => Transition::Apply(OrderStatus::Delivered),
                OrderStatus::Delivered => Transition::NoOp,
                _ => Transition::Rejected,
            },
            OrderAction::Cancel => match self {
                s if s.pre_shipment() => Transition::Apply(OrderStatus::Cancelled),
                OrderStatus::Cancelled => Transition::NoOp,
                _ => Transition::Rejected,
            },
            // Not a status transition; handled by the inventory path.
            OrderAction::UpdateInventory => Transition::NoOp,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Apply(OrderStatus),
    NoOp,
    Rejected,
}

/// One signed stock mutation for a variant row, applied under a row lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockChange {
    pub variant_id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub delta: i32,
}

/// Decrements for `update_inventory`. Empty when the order-level marker is
/// already set, which is what makes duplicate delivery safe.
pub fn decrement_plan(items: &[OrderItem], inventory_applied: bool) -> Vec<StockChange> {
    if inventory_applied {
        return Vec::new();
    }
    stock_changes(items, -1)
}

/// Increments restoring stock on cancellation. Gated on the same marker:
/// an order whose inventory was never applied has nothing to restore.
pub fn restock_plan(items: &[OrderItem], inventory_applied: bool) -> Vec<StockChange> {
    if !inventory_applied {
        return Vec::new();
    }
    stock_changes(items, 1)
}

fn stock_changes(items: &[OrderItem], sign: i32) -> Vec<StockChange> {
    items
        .iter()
        .filter_map(|item| {
            item.variant_id.map(|variant_id| StockChange {
                variant_id,
                product_id: item.product_id,
                sku: item.sku.clone(),
                delta: sign * item.quantity,
            })
        })
        .collect()
}

/// Distinct products touched by a plan, in first-seen order. One index-sync
/// job is chained per product, not per variant.
pub fn affected_products(changes: &[StockChange]) -> Vec<Uuid> {
    let mut products = Vec::new();
    for change in changes {
        if !products.contains(&change.product_id) {
            products.push(change.product_id);
        }
    }
    products
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn item(variant_id: Option<Uuid>, product_id: Uuid, quantity: i32) -> OrderItem {
        OrderItem {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            product_id,
            variant_id,
            product_name: "Trail Shoe".to_string(),
            sku: "SHOE-42".to_string(),
            unit_price: BigDecimal::from(50),
            quantity,
        }
    }

    fn order_with_totals(subtotal: i64, shipping: i64, tax: i64, discount: i64, total: i64) -> Order {
        Order {
            id: Uuid::new_v4(),
            order_number: "ORD-1001".to_string(),
            status: "pending".to_string(),
            payment_status: "pending".to_string(),
            user_email: "buyer@example.com".to_string(),
            subtotal: BigDecimal::from(subtotal),
            shipping_cost: BigDecimal::from(shipping),
            tax: BigDecimal::from(tax),
            discount: BigDecimal::from(discount),
            total: BigDecimal::from(total),
            inventory_applied: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_round_trips() {
        for s in [
            "pending",
            "confirmed",
            "processing",
            "shipped",
            "delivered",
            "cancelled",
            "refunded",
        ] {
            assert_eq!(OrderStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(OrderStatus::parse("unknown").is_err());
    }

    #[test]
    fn confirm_moves_forward_only() {
        assert_eq!(
            OrderStatus::Pending.apply(OrderAction::Confirm),
            Transition::Apply(OrderStatus::Confirmed)
        );
        assert_eq!(
            OrderStatus::Confirmed.apply(OrderAction::Confirm),
            Transition::NoOp
        );
        assert_eq!(
            OrderStatus::Shipped.apply(OrderAction::Confirm),
            Transition::Rejected
        );
    }

    #[test]
    fn cancel_rejected_after_shipment() {
        assert_eq!(
            OrderStatus::Shipped.apply(OrderAction::Cancel),
            Transition::Rejected
        );
        assert_eq!(
            OrderStatus::Delivered.apply(OrderAction::Cancel),
            Transition::Rejected
        );
        assert_eq!(
            OrderStatus::Pending.apply(OrderAction::Cancel),
            Transition::Apply(OrderStatus::Cancelled)
        );
        // Cancelling twice is harmless.
        assert_eq!(
            OrderStatus::Cancelled.apply(OrderAction::Cancel),
            Transition::NoOp
        );
    }

    #[test]
    fn deliver_requires_shipment() {
        assert_eq!(
            OrderStatus::Shipped.apply(OrderAction::Deliver),
            Transition::Apply(OrderStatus::Delivered)
        );
        assert_eq!(
            OrderStatus::Confirmed.apply(OrderAction::Deliver),
            Transition::Rejected
        );
        assert_eq!(
            OrderStatus::Delivered.apply(OrderAction::Deliver),
            Transition::NoOp
        );
    }

    #[test]
    fn totals_invariant() {
        assert!(order_with_totals(100, 10, 8, 18, 100).totals_consistent());
        assert!(!order_with_totals(100, 10, 8, 0, 100).totals_consistent());
    }

    #[test]
    fn effective_price_falls_back_to_base() {
        let base = BigDecimal::from(80);
        let mut variant = Variant {
            id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            sku: "SHOE-42".to_string(),
            price: Some(BigDecimal::from(65)),
            stock_quantity: 3,
            is_active: true,
        };
        assert_eq!(variant.effective_price(&base), BigDecimal::from(65));
        variant.price = None;
        assert_eq!(variant.effective_price(&base), BigDecimal::from(80));
    }

    fn apply_changes(stock: &mut HashMap<Uuid, i32>, changes: &[StockChange]) {
        for change in changes {
            *stock.get_mut(&change.variant_id).unwrap() += change.delta;
        }
    }

    #[test]
    fn duplicate_inventory_application_is_idempotent() {
        let product_a = Uuid::new_v4();
        let product_b = Uuid::new_v4();
        let variant_a = Uuid::new_v4();
        let variant_b = Uuid::new_v4();
        let items = vec![
            item(Some(variant_a), product_a, 2),
            item(Some(variant_b), product_b, 1),
        ];

        let mut stock = HashMap::from([(variant_a, 5), (variant_b, 1)]);

        let first = decrement_plan(&items, false);
        apply_changes(&mut stock, &first);
        // Marker is set inside the same transaction; the second delivery
        // observes it and plans nothing.
        let second = decrement_plan(&items, true);
        assert!(second.is_empty());

        assert_eq!(stock[&variant_a], 3);
        assert_eq!(stock[&variant_b], 0);
        assert!(stock.values().all(|q| *q >= 0));
    }

    #[test]
    fn restock_reverses_decrement_exactly_once() {
        let product = Uuid::new_v4();
        let variant = Uuid::new_v4();
        let items = vec![item(Some(variant), product, 2)];
        let mut stock = HashMap::from([(variant, 5)]);

        apply_changes(&mut stock, &decrement_plan(&items, false));
        assert_eq!(stock[&variant], 3);

        apply_changes(&mut stock, &restock_plan(&items, true));
        assert_eq!(stock[&variant], 5);

        // A second cancellation never reaches the restock path (the status
        // check no-ops it), and an unapplied order restores nothing.
        assert!(restock_plan(&items, false).is_empty());
    }

    #[test]
    fn items_without_variants_are_skipped() {
        let product = Uuid::new_v4();
        let items = vec![item(None, product, 4)];
        assert!(decrement_plan(&items, false).is_empty());
    }

    #[test]
    fn affected_products_deduplicates() {
        let product_a = Uuid::new_v4();
        let product_b = Uuid::new_v4();
        let items = vec![
            item(Some(Uuid::new_v4()), product_a, 1),
            item(Some(Uuid::new_v4()), product_a, 2),
            item(Some(Uuid::new_v4()), product_b, 1),
        ];
        let changes = decrement_plan(&items, false);
        assert_eq!(affected_products(&changes), vec![product_a, product_b]);
    }
}
