use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::order_item::FulfillmentStatus;
use crate::entities::return_request::Decision;

/// Domain events emitted after a workflow transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
        total: Decimal,
    },
    OrderPaid {
        order_id: Uuid,
        payment_reference: Option<String>,
    },
    PaymentFailed {
        order_id: Uuid,
        reason: String,
    },
    OrderCancelled {
        order_id: Uuid,
        cancelled_by: Uuid,
        reason: String,
        refund_due: bool,
    },
    ItemAdvanced {
        order_id: Uuid,
        item_id: Uuid,
        from: FulfillmentStatus,
        to: FulfillmentStatus,
    },
    DeliveryAssigned {
        order_id: Uuid,
        agent_id: Uuid,
        item_ids: Vec<Uuid>,
    },
    DeliveryFailed {
        order_id: Uuid,
        item_id: Uuid,
        reason: String,
    },
    DeliveryRescheduled {
        order_id: Uuid,
        item_id: Uuid,
    },
    OtpIssued {
        item_id: Uuid,
        resend: bool,
    },
    ItemDelivered {
        order_id: Uuid,
        item_id: Uuid,
    },
    ReturnCreated {
        return_id: Uuid,
        order_item_id: Uuid,
    },
    ReturnDecided {
        return_id: Uuid,
        stage: RemediationStage,
        decision: Decision,
    },
    ReturnRefunded {
        return_id: Uuid,
        amount: Decimal,
        refund_reference: String,
    },
    ReplacementCreated {
        replacement_id: Uuid,
        order_item_id: Uuid,
    },
    ReplacementDecided {
        replacement_id: Uuid,
        stage: RemediationStage,
        decision: Decision,
    },
    GuestCartReconciled {
        user_id: Uuid,
        merged: usize,
        skipped: usize,
        failed: usize,
        replayed: bool,
    },
}

impl Event {
    /// Short name used for logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderPaid { .. } => "order_paid",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::ItemAdvanced { .. } => "item_advanced",
            Event::DeliveryAssigned { .. } => "delivery_assigned",
            Event::DeliveryFailed { .. } => "delivery_failed",
            Event::DeliveryRescheduled { .. } => "delivery_rescheduled",
            Event::OtpIssued { .. } => "otp_issued",
            Event::ItemDelivered { .. } => "item_delivered",
            Event::ReturnCreated { .. } => "return_created",
            Event::ReturnDecided { .. } => "return_decided",
            Event::ReturnRefunded { .. } => "return_refunded",
            Event::ReplacementCreated { .. } => "replacement_created",
            Event::ReplacementDecided { .. } => "replacement_decided",
            Event::GuestCartReconciled { .. } => "guest_cart_reconciled",
        }
    }
}

/// Sign-off stage of a return or replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemediationStage {
    Pickup,
    Warehouse,
    Admin,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is gone.
    /// The workflow change it describes has already committed.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "Dropping domain event");
            counter!("fulfillment.events.dropped", 1);
        }
    }
}

/// Consumer of domain events. Notification delivery, search indexing and the
/// like hang off implementations of this trait.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Default handler: structured log line plus a per-event counter.
#[derive(Debug, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
        info!(event = event.name(), payload = %payload, "Domain event");
        counter!("fulfillment.events.processed", 1, "event" => event.name());
        Ok(())
    }
}

/// Drains the event channel, fanning each event out to every handler.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "Event handler failed");
            }
        }
    }

    info!("Event channel closed; event processing loop finished");
}
