use anyhow::{bail, Result};
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{
    IndexProductPayload, JobEnvelope, OrderAction, ProcessOrderPayload, ProductEventKind,
    SendOrderEmailPayload, INDEX_PRODUCT_TASK, PROCESS_ORDER_TASK, SEND_ORDER_EMAIL_TASK,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::index::{IndexClient, ProductDoc};
use crate::models::{
    affected_products, decrement_plan, restock_plan, Order, OrderItem, OrderStatus, Product,
    StockChange, Transition, Variant,
};
use crate::publisher::Publisher;
use crate::schema::{order_items, orders, products, variants};

type DbPool = Pool<AsyncPgConnection>;

/// How a handler left the job. Errors are not outcomes; they flow into the
/// consumer's retry policy.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    /// A business rule refused the action. Logged and acked, never retried.
    Rejected(String),
}

/// Closed set of task handlers, one variant per worker kind, resolved once
/// at startup.
pub enum Dispatcher {
    Search(SearchIndexHandler),
    Email(EmailHandler),
    Order(OrderHandler),
}

impl Dispatcher {
    pub fn search(pool: DbPool, index: IndexClient) -> Self {
        Dispatcher::Search(SearchIndexHandler { pool, index })
    }

    pub fn email() -> Self {
        Dispatcher::Email(EmailHandler)
    }

    pub fn order(pool: DbPool, publisher: Publisher) -> Self {
        Dispatcher::Order(OrderHandler { pool, publisher })
    }

    pub async fn handle(&self, job: &JobEnvelope) -> Result<Outcome> {
        match self {
            Dispatcher::Search(handler) => handler.handle(job).await,
            Dispatcher::Email(handler) => handler.handle(job).await,
            Dispatcher::Order(handler) => handler.handle(job).await,
        }
    }
}

/// Keeps the search index in step with the catalog. Both directions are
/// idempotent: upserts rewrite the same document ids with the same derived
/// content, deletes of absent documents are no-ops.
pub struct SearchIndexHandler {
    pool: DbPool,
    index: IndexClient,
}

impl SearchIndexHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<Outcome> {
        if job.task_name != INDEX_PRODUCT_TASK {
            bail!("unknown task name: {}", job.task_name);
        }
        let payload: IndexProductPayload = serde_json::from_value(job.payload.clone())?;

        match payload.event_type {
            ProductEventKind::Delete => {
                self.index.delete_by_product(payload.product_id).await?;
                info!(
                    product_id = %payload.product_id,
                    trace_id = %job.trace_id,
                    "deleted product from search index"
                );
            }
            ProductEventKind::Update => {
                let mut conn = self.pool.get().await?;

                let product = products::table
                    .find(payload.product_id)
                    .first::<Product>(&mut conn)
                    .await
                    .optional()?;
                let Some(product) = product else {
                    bail!("product {} not found", payload.product_id);
                };

                let docs = if product.has_variants {
                    let variants = variants::table
                        .filter(variants::product_id.eq(product.id))
                        .filter(variants::is_active.eq(true))
                        .load::<Variant>(&mut conn)
                        .await?;
                    variants
                        .iter()
                        .map(|variant| ProductDoc::for_variant(&product, variant))
                        .collect::<Vec<_>>()
                } else {
                    vec![ProductDoc::for_product(&product)]
                };

                for doc in &docs {
                    self.index.upsert(doc).await?;
                }
                info!(
                    product_id = %product.id,
                    trace_id = %job.trace_id,
                    documents = docs.len(),
                    "indexed product in search index"
                );
            }
        }
        Ok(Outcome::Completed)
    }
}

/// Stub dispatch through the external mail channel. Failures here are
/// retryable and never touch order state.
pub struct EmailHandler;

impl EmailHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<Outcome> {
        if job.task_name != SEND_ORDER_EMAIL_TASK {
            bail!("unknown task name: {}", job.task_name);
        }
        let payload: SendOrderEmailPayload = serde_json::from_value(job.payload.clone())?;

        info!(
            order_number = %payload.order_number,
            recipient = %payload.user_email,
            trace_id = %job.trace_id,
            "sending order confirmation email"
        );
        Ok(Outcome::Completed)
    }
}

enum InventoryStep {
    AlreadyApplied,
    Refused(String),
    Applied(Vec<Uuid>),
}

/// Applies order-lifecycle transitions and the inventory side effects that
/// hang off them. Every stock mutation happens inside a transaction holding
/// `FOR UPDATE` locks on the order row and the affected variant rows,
/// against the primary store.
pub struct OrderHandler {
    pool: DbPool,
    publisher: Publisher,
}

impl OrderHandler {
    async fn handle(&self, job: &JobEnvelope) -> Result<Outcome> {
        if job.task_name != PROCESS_ORDER_TASK {
            bail!("unknown task name: {}", job.task_name);
        }
        let payload: ProcessOrderPayload = serde_json::from_value(job.payload.clone())?;
        info!(
            order_id = %payload.order_id,
            action = %payload.action,
            trace_id = %job.trace_id,
            "processing order"
        );

        match payload.action {
            OrderAction::UpdateInventory => {
                self.update_inventory(payload.order_id, job.trace_id).await
            }
            OrderAction::Cancel => self.cancel(payload.order_id).await,
            action => self.transition(payload.order_id, action, job.trace_id).await,
        }
    }

    async fn transition(
        &self,
        order_id: Uuid,
        action: OrderAction,
        trace_id: Uuid,
    ) -> Result<Outcome> {
        let mut conn = self.pool.get().await?;

        let (outcome, confirmed) = conn
            .transaction::<(Outcome, Option<Order>), anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let order = orders::table
                        .find(order_id)
                        .for_update()
                        .first::<Order>(conn)
                        .await
                        .optional()?;
                    let Some(order) = order else {
                        bail!("order {} not found", order_id);
                    };
                    // The ordering flow upstream fixes the totals at
                    // creation; a mismatch here means the row was tampered
                    // with. Flag it, don't block the transition.
                    if !order.totals_consistent() {
                        warn!(
                            order_number = %order.order_number,
                            "order totals do not reconcile"
                        );
                    }
                    let status = OrderStatus::parse(&order.status)?;

                    match status.apply(action) {
                        Transition::Apply(next) => {
                            diesel::update(orders::table.find(order_id))
                                .set((
                                    orders::status.eq(next.as_str()),
                                    orders::updated_at.eq(Utc::now()),
                                ))
                                .execute(conn)
                                .await?;
                            info!(
                                order_number = %order.order_number,
                                from = %status,
                                to = %next,
                                "order transitioned"
                            );
                            let confirmed =
                                (action == OrderAction::Confirm).then(|| order.clone());
                            Ok((Outcome::Completed, confirmed))
                        }
                        Transition::NoOp => {
                            info!(
                                order_number = %order.order_number,
                                "action {} already satisfied",
                                action
                            );
                            Ok((Outcome::Completed, None))
                        }
                        Transition::Rejected => Ok((
                            Outcome::Rejected(format!(
                                "cannot {} order {} - already {}",
                                action, order.order_number, status
                            )),
                            None,
                        )),
                    }
                })
            })
            .await?;

        if let Some(order) = confirmed {
            self.publisher
                .publish_order_confirmation(&order, Some(trace_id))
                .await;
        }
        Ok(outcome)
    }

    async fn cancel(&self, order_id: Uuid) -> Result<Outcome> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<Outcome, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let order = orders::table
                    .find(order_id)
                    .for_update()
                    .first::<Order>(conn)
                    .await
                    .optional()?;
                let Some(order) = order else {
                    bail!("order {} not found", order_id);
                };
                let status = OrderStatus::parse(&order.status)?;

                match status.apply(OrderAction::Cancel) {
                    Transition::Rejected => Ok(Outcome::Rejected(format!(
                        "cannot cancel order {} - already {}",
                        order.order_number, status
                    ))),
                    Transition::NoOp => {
                        info!(order_number = %order.order_number, "order already cancelled");
                        Ok(Outcome::Completed)
                    }
                    Transition::Apply(next) => {
                        let items = order_items::table
                            .filter(order_items::order_id.eq(order_id))
                            .load::<OrderItem>(conn)
                            .await?;
                        // Restock only what update_inventory actually took;
                        // the marker keeps a never-applied order from
                        // minting phantom stock.
                        for change in restock_plan(&items, order.inventory_applied) {
                            apply_stock_change(conn, &change).await?;
                        }
                        diesel::update(orders::table.find(order_id))
                            .set((
                                orders::status.eq(next.as_str()),
                                orders::updated_at.eq(Utc::now()),
                            ))
                            .execute(conn)
                            .await?;
                        info!(
                            order_number = %order.order_number,
                            "order cancelled and stock restored"
                        );
                        Ok(Outcome::Completed)
                    }
                }
            })
        })
        .await
    }

    async fn update_inventory(&self, order_id: Uuid, trace_id: Uuid) -> Result<Outcome> {
        let mut conn = self.pool.get().await?;

        let step = conn
            .transaction::<InventoryStep, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let order = orders::table
                        .find(order_id)
                        .for_update()
                        .first::<Order>(conn)
                        .await
                        .optional()?;
                    let Some(order) = order else {
                        bail!("order {} not found", order_id);
                    };

                    // Checked and set under the same order-row lock as the
                    // decrement, so a duplicate delivery can never
                    // double-decrement.
                    if order.inventory_applied {
                        info!(
                            order_number = %order.order_number,
                            "inventory already applied, skipping duplicate delivery"
                        );
                        return Ok(InventoryStep::AlreadyApplied);
                    }

                    let status = OrderStatus::parse(&order.status)?;
                    if matches!(status, OrderStatus::Cancelled | OrderStatus::Refunded) {
                        return Ok(InventoryStep::Refused(format!(
                            "cannot apply inventory to order {} - already {}",
                            order.order_number, status
                        )));
                    }

                    let items = order_items::table
                        .filter(order_items::order_id.eq(order_id))
                        .load::<OrderItem>(conn)
                        .await?;
                    let changes = decrement_plan(&items, order.inventory_applied);
                    for change in &changes {
                        apply_stock_change(conn, change).await?;
                    }

                    diesel::update(orders::table.find(order_id))
                        .set((
                            orders::inventory_applied.eq(true),
                            orders::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    Ok(InventoryStep::Applied(affected_products(&changes)))
                })
            })
            .await?;

        match step {
            InventoryStep::AlreadyApplied => Ok(Outcome::Completed),
            InventoryStep::Refused(reason) => Ok(Outcome::Rejected(reason)),
            InventoryStep::Applied(product_ids) => {
                // Chain a search-sync job per affected product so stock
                // status stays search-visible.
                for product_id in product_ids {
                    self.publisher
                        .publish_product_event(product_id, ProductEventKind::Update, Some(trace_id))
                        .await;
                }
                Ok(Outcome::Completed)
            }
        }
    }
}

/// One signed stock adjustment under an exclusive lock on the variant row,
/// held for the whole read-check-write sequence. Stock can never go
/// negative; an over-commit surfaces as an error for the retry policy.
async fn apply_stock_change(conn: &mut AsyncPgConnection, change: &StockChange) -> Result<()> {
    let variant = variants::table
        .find(change.variant_id)
        .for_update()
        .first::<Variant>(conn)
        .await
        .optional()?;
    let Some(variant) = variant else {
        bail!("variant {} ({}) not found", change.variant_id, change.sku);
    };

    let next = variant.stock_quantity + change.delta;
    if next < 0 {
        bail!(
            "insufficient stock for sku {}: have {}, need {}",
            variant.sku,
            variant.stock_quantity,
            -change.delta
        );
    }

    diesel::update(variants::table.find(change.variant_id))
        .set(variants::stock_quantity.eq(next))
        .execute(conn)
        .await?;
    info!(sku = %variant.sku, delta = change.delta, stock = next, "adjusted variant stock");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn email_handler_completes_on_valid_payload() {
        let payload = SendOrderEmailPayload {
            order_id: Uuid::new_v4(),
            order_number: "ORD-1001".to_string(),
            user_email: "buyer@example.com".to_string(),
        };
        let job = JobEnvelope::new(
            SEND_ORDER_EMAIL_TASK,
            serde_json::to_value(&payload).unwrap(),
            None,
        );
        assert!(matches!(
            EmailHandler.handle(&job).await.unwrap(),
            Outcome::Completed
        ));
    }

    #[tokio::test]
    async fn email_handler_fails_fast_on_unknown_task() {
        let job = JobEnvelope::new("mystery_task", serde_json::json!({}), None);
        assert!(EmailHandler.handle(&job).await.is_err());
    }

    #[tokio::test]
    async fn email_handler_fails_on_malformed_payload() {
        let job = JobEnvelope::new(
            SEND_ORDER_EMAIL_TASK,
            serde_json::json!({"order_id": "not-a-uuid"}),
            None,
        );
        assert!(EmailHandler.handle(&job).await.is_err());
    }
}
