//! Fulfillment State Machine.
//!
//! Per-item lifecycle `pending -> picked -> packed -> shipped ->
//! out_for_delivery -> {delivered | failed}`, order-level cancellation, and
//! the aggregate order status derived from the items.
//!
//! Every transition re-reads the order and item under a row lock (order
//! first, then items), validates its guard, and writes through a version
//! predicate. A step that loses a write race is re-run, so the second actor
//! observes the advanced state and is rejected with the guard error for that
//! state.

use crate::auth::{Actor, ActorRole};
use crate::entities::{
    order::{self, OrderStatus},
    order_item::{self, FulfillmentStatus, OtpStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::retry::{with_retry, RetryConfig};
use crate::services::{find_item, find_order, find_order_by_number, items_of, stock_ledger, OrderDetails};
use chrono::Utc;
use metrics::counter;
use sea_orm::{ConnectionTrait, DatabaseConnection, DatabaseTransaction, Set, TransactionTrait};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct FulfillmentService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl FulfillmentService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Warehouse step: `pending -> picked`, `picked -> packed` or
    /// `packed -> shipped`. Any other target is rejected.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn advance_item(
        &self,
        actor: Actor,
        item_id: Uuid,
        target: FulfillmentStatus,
    ) -> Result<order_item::Model, ServiceError> {
        let result = with_retry(&RetryConfig::default(), move || {
            self.advance_item_inner(actor, item_id, target)
        })
        .await;
        record_rejection("advance_item", &result);
        result
    }

    async fn advance_item_inner(
        &self,
        actor: Actor,
        item_id: Uuid,
        target: FulfillmentStatus,
    ) -> Result<order_item::Model, ServiceError> {
        actor.require_role(&[ActorRole::Warehouse], "advance items through the warehouse")?;

        let txn = self.db.begin().await?;
        let (order, item) = lock_order_and_item(&txn, item_id).await?;

        if order.is_cancelled() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is cancelled",
                order.order_number
            )));
        }
        check_warehouse_transition(item.status, target)?;
        if target == FulfillmentStatus::Picked && order.awaiting_online_payment() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is awaiting online payment",
                order.order_number
            )));
        }

        let now = Utc::now();
        let mut changes = order_item::ActiveModel {
            status: Set(target),
            ..Default::default()
        };
        match target {
            FulfillmentStatus::Picked => changes.picked_at = Set(Some(now)),
            FulfillmentStatus::Packed => changes.packed_at = Set(Some(now)),
            FulfillmentStatus::Shipped => changes.shipped_at = Set(Some(now)),
            _ => {}
        }
        let from = item.status;
        let updated = item.apply(&txn, changes).await?;
        refresh_order_status(&txn, &order).await?;

        txn.commit().await?;

        info!(
            order_id = %updated.order_id,
            item_id = %updated.id,
            from = %from,
            to = %target,
            "Order item advanced"
        );
        counter!("fulfillment.transition.applied", 1, "to" => target.to_string());
        self.event_sender
            .send_or_log(Event::ItemAdvanced {
                order_id: updated.order_id,
                item_id: updated.id,
                from,
                to: target,
            })
            .await;
        Ok(updated)
    }

    /// Cancels an order while nothing has been picked yet. Live items are
    /// voided and their quantities go back to stock.
    #[instrument(skip(self, reason), fields(actor_id = %actor.id))]
    pub async fn cancel_order(
        &self,
        actor: Actor,
        order_number: &str,
        reason: &str,
    ) -> Result<OrderDetails, ServiceError> {
        let result = with_retry(&RetryConfig::default(), move || {
            self.cancel_order_inner(actor, order_number, reason)
        })
        .await;
        record_rejection("cancel_order", &result);
        result
    }

    async fn cancel_order_inner(
        &self,
        actor: Actor,
        order_number: &str,
        reason: &str,
    ) -> Result<OrderDetails, ServiceError> {
        actor.require_role(&[ActorRole::Customer, ActorRole::Admin], "cancel orders")?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "a cancellation reason is required".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let order = find_order_by_number(&txn, order_number, true).await?;
        actor.require_owner(order.user_id, "order")?;

        if order.is_cancelled() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is already cancelled",
                order.order_number
            )));
        }

        let items = items_of(&txn, order.id, true).await?;
        if !cancellation_allowed(&items) {
            return Err(ServiceError::CancellationWindowClosed(format!(
                "picking has started for order {}",
                order.order_number
            )));
        }

        let mut voided = Vec::with_capacity(items.len());
        for item in items {
            if item.status.is_terminal() {
                voided.push(item);
                continue;
            }
            stock_ledger::release(&txn, item.variant_id, item.quantity).await?;
            let updated = item
                .apply(
                    &txn,
                    order_item::ActiveModel {
                        status: Set(FulfillmentStatus::Cancelled),
                        otp_hash: Set(None),
                        otp_expires_at: Set(None),
                        ..Default::default()
                    },
                )
                .await?;
            voided.push(updated);
        }

        let refund_due = order.is_paid;
        let cancelled = order
            .apply(
                &txn,
                order::ActiveModel {
                    status: Set(OrderStatus::Cancelled),
                    cancellation_reason: Set(Some(reason.to_string())),
                    cancelled_by: Set(Some(actor.id)),
                    cancelled_at: Set(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;

        txn.commit().await?;

        info!(
            order_id = %cancelled.id,
            order_number = %cancelled.order_number,
            cancelled_by = %actor.id,
            refund_due,
            "Order cancelled"
        );
        counter!("fulfillment.orders.cancelled", 1);
        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id: cancelled.id,
                cancelled_by: actor.id,
                reason: reason.to_string(),
                refund_due,
            })
            .await;

        Ok(OrderDetails {
            order: cancelled,
            items: voided,
        })
    }

    /// Hands a fully shipped order to a delivery agent, moving every live
    /// item to `out_for_delivery`.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn assign_delivery_agent(
        &self,
        actor: Actor,
        order_number: &str,
        agent_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let result = with_retry(&RetryConfig::default(), move || {
            self.assign_delivery_agent_inner(actor, order_number, agent_id)
        })
        .await;
        record_rejection("assign_delivery_agent", &result);
        result
    }

    async fn assign_delivery_agent_inner(
        &self,
        actor: Actor,
        order_number: &str,
        agent_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        actor.require_role(
            &[ActorRole::Admin, ActorRole::Warehouse],
            "assign delivery agents",
        )?;

        let txn = self.db.begin().await?;
        let order = find_order_by_number(&txn, order_number, true).await?;
        if order.is_cancelled() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is cancelled",
                order.order_number
            )));
        }

        let items = items_of(&txn, order.id, true).await?;
        let live: Vec<&order_item::Model> = items
            .iter()
            .filter(|item| item.status != FulfillmentStatus::Cancelled)
            .collect();
        if live.is_empty() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} has no items to deliver",
                order.order_number
            )));
        }
        if let Some(blocking) = live
            .iter()
            .find(|item| item.status != FulfillmentStatus::Shipped)
        {
            return Err(ServiceError::InvalidTransition(format!(
                "item {} is {}, every item must be shipped before assignment",
                blocking.id, blocking.status
            )));
        }

        let now = Utc::now();
        let mut updated_items = Vec::with_capacity(items.len());
        for item in items {
            if item.status != FulfillmentStatus::Shipped {
                updated_items.push(item);
                continue;
            }
            let updated = item
                .apply(
                    &txn,
                    order_item::ActiveModel {
                        status: Set(FulfillmentStatus::OutForDelivery),
                        out_for_delivery_at: Set(Some(now)),
                        ..Default::default()
                    },
                )
                .await?;
            updated_items.push(updated);
        }

        let assigned = order
            .apply(
                &txn,
                order::ActiveModel {
                    delivery_agent_id: Set(Some(agent_id)),
                    assigned_at: Set(Some(now)),
                    ..Default::default()
                },
            )
            .await?;
        let assigned = refresh_order_status(&txn, &assigned).await?;

        txn.commit().await?;

        let item_ids: Vec<Uuid> = updated_items
            .iter()
            .filter(|item| item.status == FulfillmentStatus::OutForDelivery)
            .map(|item| item.id)
            .collect();
        info!(
            order_id = %assigned.id,
            agent_id = %agent_id,
            items = item_ids.len(),
            "Delivery agent assigned"
        );
        self.event_sender
            .send_or_log(Event::DeliveryAssigned {
                order_id: assigned.id,
                agent_id,
                item_ids,
            })
            .await;

        Ok(OrderDetails {
            order: assigned,
            items: updated_items,
        })
    }

    /// Delivery agent records a failed handover attempt. Any outstanding OTP
    /// is voided.
    #[instrument(skip(self, reason), fields(actor_id = %actor.id))]
    pub async fn mark_delivery_failed(
        &self,
        actor: Actor,
        item_id: Uuid,
        reason: &str,
    ) -> Result<order_item::Model, ServiceError> {
        let result = with_retry(&RetryConfig::default(), move || {
            self.mark_delivery_failed_inner(actor, item_id, reason)
        })
        .await;
        record_rejection("mark_delivery_failed", &result);
        result
    }

    async fn mark_delivery_failed_inner(
        &self,
        actor: Actor,
        item_id: Uuid,
        reason: &str,
    ) -> Result<order_item::Model, ServiceError> {
        actor.require_role(&[ActorRole::DeliveryAgent], "record delivery failures")?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ServiceError::ValidationError(
                "a failure reason is required".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let (order, item) = lock_order_and_item(&txn, item_id).await?;
        require_assigned_agent(&actor, &order)?;

        if item.status != FulfillmentStatus::OutForDelivery {
            return Err(ServiceError::InvalidTransition(format!(
                "item {} is {}, only out_for_delivery items can fail delivery",
                item.id, item.status
            )));
        }

        let updated = item
            .apply(
                &txn,
                order_item::ActiveModel {
                    status: Set(FulfillmentStatus::Failed),
                    failed_at: Set(Some(Utc::now())),
                    failure_reason: Set(Some(reason.to_string())),
                    otp_hash: Set(None),
                    otp_status: Set(OtpStatus::NotSent),
                    otp_expires_at: Set(None),
                    otp_attempts: Set(0),
                    ..Default::default()
                },
            )
            .await?;
        refresh_order_status(&txn, &order).await?;

        txn.commit().await?;

        warn!(order_id = %order.id, item_id = %updated.id, reason, "Delivery attempt failed");
        counter!("fulfillment.delivery.failed", 1);
        self.event_sender
            .send_or_log(Event::DeliveryFailed {
                order_id: order.id,
                item_id: updated.id,
                reason: reason.to_string(),
            })
            .await;
        Ok(updated)
    }

    /// Puts a failed item back out for delivery.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn reschedule_delivery(
        &self,
        actor: Actor,
        item_id: Uuid,
    ) -> Result<order_item::Model, ServiceError> {
        let result = with_retry(&RetryConfig::default(), move || {
            self.reschedule_delivery_inner(actor, item_id)
        })
        .await;
        record_rejection("reschedule_delivery", &result);
        result
    }

    async fn reschedule_delivery_inner(
        &self,
        actor: Actor,
        item_id: Uuid,
    ) -> Result<order_item::Model, ServiceError> {
        actor.require_role(&[ActorRole::DeliveryAgent], "reschedule deliveries")?;

        let txn = self.db.begin().await?;
        let (order, item) = lock_order_and_item(&txn, item_id).await?;
        require_assigned_agent(&actor, &order)?;

        if item.status != FulfillmentStatus::Failed {
            return Err(ServiceError::InvalidTransition(format!(
                "item {} is {}, only failed deliveries can be rescheduled",
                item.id, item.status
            )));
        }

        let updated = item
            .apply(
                &txn,
                order_item::ActiveModel {
                    status: Set(FulfillmentStatus::OutForDelivery),
                    out_for_delivery_at: Set(Some(Utc::now())),
                    failed_at: Set(None),
                    failure_reason: Set(None),
                    ..Default::default()
                },
            )
            .await?;
        refresh_order_status(&txn, &order).await?;

        txn.commit().await?;

        info!(order_id = %order.id, item_id = %updated.id, "Delivery rescheduled");
        self.event_sender
            .send_or_log(Event::DeliveryRescheduled {
                order_id: order.id,
                item_id: updated.id,
            })
            .await;
        Ok(updated)
    }

    /// Order with items, visible to its owner, staff, and the assigned agent.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn get_order(&self, actor: Actor, order_number: &str) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db;
        let order = find_order_by_number(db, order_number, false).await?;
        match actor.role {
            ActorRole::Customer => actor.require_owner(order.user_id, "order")?,
            ActorRole::DeliveryAgent => require_assigned_agent(&actor, &order)?,
            ActorRole::Warehouse | ActorRole::Admin => {}
        }
        let items = items_of(db, order.id, false).await?;
        Ok(OrderDetails { order, items })
    }
}

/// Locks the item's order, then the item itself.
pub(crate) async fn lock_order_and_item(
    txn: &DatabaseTransaction,
    item_id: Uuid,
) -> Result<(order::Model, order_item::Model), ServiceError> {
    let located = find_item(txn, item_id, false).await?;
    let order = find_order(txn, located.order_id, true).await?;
    let item = find_item(txn, item_id, true).await?;
    Ok((order, item))
}

pub(crate) fn require_assigned_agent(actor: &Actor, order: &order::Model) -> Result<(), ServiceError> {
    if order.delivery_agent_id != Some(actor.id) {
        return Err(ServiceError::NotAssigned(format!(
            "order {} is not assigned to agent {}",
            order.order_number, actor.id
        )));
    }
    Ok(())
}

/// Recomputes the derived order status from its items and writes it if it
/// moved. Cancelled orders are left untouched.
pub(crate) async fn refresh_order_status<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
) -> Result<order::Model, ServiceError> {
    let current = find_order(conn, order.id, false).await?;
    if current.is_cancelled() {
        return Ok(current);
    }
    let items = items_of(conn, current.id, false).await?;
    let Some(status) = aggregate_status(items.iter().map(|item| item.status)) else {
        return Ok(current);
    };
    if status == current.status {
        return Ok(current);
    }
    current
        .apply(
            conn,
            order::ActiveModel {
                status: Set(status),
                ..Default::default()
            },
        )
        .await
}

/// Guard for the warehouse-driven part of the lifecycle.
pub fn check_warehouse_transition(
    from: FulfillmentStatus,
    to: FulfillmentStatus,
) -> Result<(), ServiceError> {
    use FulfillmentStatus::*;
    match (from, to) {
        (Pending, Picked) | (Picked, Packed) | (Packed, Shipped) => Ok(()),
        (_, Delivered) => Err(ServiceError::InvalidTransition(
            "delivery can only be completed through OTP verification".to_string(),
        )),
        (_, OutForDelivery) => Err(ServiceError::InvalidTransition(
            "items go out for delivery when the order is assigned to an agent".to_string(),
        )),
        (from, to) => Err(ServiceError::InvalidTransition(format!(
            "cannot move item from {} to {}",
            from, to
        ))),
    }
}

/// Cancellation is open until the first item has been picked.
pub fn cancellation_allowed(items: &[order_item::Model]) -> bool {
    items.iter().all(|item| item.picked_at.is_none())
}

/// Order status for a single item's state.
pub fn order_status_for(status: FulfillmentStatus) -> OrderStatus {
    match status {
        FulfillmentStatus::Pending => OrderStatus::Pending,
        FulfillmentStatus::Picked | FulfillmentStatus::Packed => OrderStatus::Processing,
        FulfillmentStatus::Shipped => OrderStatus::Shipped,
        FulfillmentStatus::OutForDelivery => OrderStatus::OutForDelivery,
        FulfillmentStatus::Failed => OrderStatus::DeliveryFailed,
        FulfillmentStatus::Delivered => OrderStatus::Delivered,
        FulfillmentStatus::Cancelled => OrderStatus::Cancelled,
    }
}

/// Minimum-progress state across the live (non-cancelled) items, or `None`
/// when no live item remains.
pub fn aggregate_status<I>(statuses: I) -> Option<OrderStatus>
where
    I: IntoIterator<Item = FulfillmentStatus>,
{
    statuses
        .into_iter()
        .filter(|status| *status != FulfillmentStatus::Cancelled)
        .min_by_key(|status| status.progress_rank())
        .map(order_status_for)
}

fn record_rejection<T>(operation: &'static str, result: &Result<T, ServiceError>) {
    if let Err(e) = result {
        if e.is_deterministic_rejection() {
            counter!(
                "fulfillment.transition.rejected",
                1,
                "operation" => operation,
                "reason" => e.code()
            );
        }
    }
}
