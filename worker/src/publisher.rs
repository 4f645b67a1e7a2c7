use anyhow::Result;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::{
    IndexProductPayload, JobEnvelope, ProductEventKind, SendOrderEmailPayload,
    INDEX_PRODUCT_TASK, ORDER_EMAIL_QUEUE, SEARCH_INDEX_QUEUE, SEND_ORDER_EMAIL_TASK,
};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::Order;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Enqueues jobs for other workers. Fire-and-forget: a transport failure is
/// logged and swallowed so it can never roll back the caller's own work.
#[derive(Clone)]
pub struct Publisher {
    producer: FutureProducer,
}

impl Publisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }

    pub async fn publish(
        &self,
        queue: &str,
        task_name: &str,
        payload: serde_json::Value,
        trace_id: Option<Uuid>,
    ) {
        let envelope = JobEnvelope::new(task_name, payload, trace_id);
        if let Err(e) = self.try_publish(queue, &envelope).await {
            error!(
                queue,
                task_name,
                job_id = %envelope.job_id,
                "failed to publish job: {:#}",
                e
            );
        }
    }

    async fn try_publish(&self, queue: &str, envelope: &JobEnvelope) -> Result<()> {
        let body = serde_json::to_string(envelope)?;
        let key = envelope.job_id.to_string();
        let record = FutureRecord::to(queue).payload(&body).key(&key);

        self.producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to enqueue message: {}", e))?;

        info!(
            queue,
            task_name = %envelope.task_name,
            job_id = %envelope.job_id,
            trace_id = %envelope.trace_id,
            "job published"
        );
        Ok(())
    }

    /// Chains a search-sync job for one product.
    pub async fn publish_product_event(
        &self,
        product_id: Uuid,
        event_type: ProductEventKind,
        trace_id: Option<Uuid>,
    ) {
        let payload = IndexProductPayload {
            product_id,
            event_type,
        };
        match serde_json::to_value(&payload) {
            Ok(payload) => {
                self.publish(SEARCH_INDEX_QUEUE, INDEX_PRODUCT_TASK, payload, trace_id)
                    .await
            }
            Err(e) => error!(%product_id, "failed to encode product event: {}", e),
        }
    }

    /// Chains the confirmation email job for a freshly confirmed order.
    pub async fn publish_order_confirmation(&self, order: &Order, trace_id: Option<Uuid>) {
        let payload = SendOrderEmailPayload {
            order_id: order.id,
            order_number: order.order_number.clone(),
            user_email: order.user_email.clone(),
        };
        match serde_json::to_value(&payload) {
            Ok(payload) => {
                self.publish(ORDER_EMAIL_QUEUE, SEND_ORDER_EMAIL_TASK, payload, trace_id)
                    .await
            }
            Err(e) => error!(order_id = %order.id, "failed to encode email event: {}", e),
        }
    }
}
