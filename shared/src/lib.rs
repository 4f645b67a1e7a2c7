use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Queue names. Each queue is paired with a `<name>_dlq` dead-letter queue.
pub const SEARCH_INDEX_QUEUE: &str = "search.index_product";
pub const ORDER_EMAIL_QUEUE: &str = "email.send_order_confirmation";
pub const ORDER_PROCESS_QUEUE: &str = "order.process";

pub const INDEX_PRODUCT_TASK: &str = "index_product";
pub const SEND_ORDER_EMAIL_TASK: &str = "send_order_email";
pub const PROCESS_ORDER_TASK: &str = "process_order";

/// Transport header carrying the consumer-owned retry counter.
/// Absent on first delivery; handlers never read or write it.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

pub fn dlq_name(queue: &str) -> String {
    format!("{}_dlq", queue)
}

/// Wire contract for one queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub task_name: String,
    pub job_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub trace_id: Uuid,
}

impl JobEnvelope {
    pub fn new(task_name: &str, payload: serde_json::Value, trace_id: Option<Uuid>) -> Self {
        Self {
            task_name: task_name.to_string(),
            job_id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
            trace_id: trace_id.unwrap_or_else(Uuid::new_v4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductEventKind {
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexProductPayload {
    pub product_id: Uuid,
    #[serde(default = "default_event_kind")]
    pub event_type: ProductEventKind,
}

fn default_event_kind() -> ProductEventKind {
    ProductEventKind::Update
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Confirm,
    Ship,
    Deliver,
    Cancel,
    UpdateInventory,
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderAction::Confirm => "confirm",
            OrderAction::Ship => "ship",
            OrderAction::Deliver => "deliver",
            OrderAction::Cancel => "cancel",
            OrderAction::UpdateInventory => "update_inventory",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOrderPayload {
    pub order_id: Uuid,
    pub action: OrderAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOrderEmailPayload {
    pub order_id: Uuid,
    pub order_number: String,
    pub user_email: String,
}
