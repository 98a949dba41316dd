//! Order Intake: turns a checkout request into an order.
//!
//! Stock decrements, the order row and its items are written in one
//! transaction; a failure on any line rolls back every decrement. Payment is
//! started only after the order has committed, and once it has committed the
//! caller always gets the order back.

use crate::auth::{Actor, ActorRole};
use crate::entities::{
    cart::{self, Entity as Cart},
    cart_item::{self, Entity as CartItem},
    guest_cart_merge::{self, Entity as GuestCartMerge},
    order::{self, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress},
    order_item::{self, FulfillmentStatus, OtpStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::retry::{with_retry, RetryConfig};
use crate::services::payments::PaymentService;
use crate::services::pricing::DeliveryPricing;
use crate::services::{find_order, items_of, stock_ledger, OrderDetails};
use chrono::Utc;
use metrics::counter;
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// One requested `(variant, quantity)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub variant_id: Uuid,
    pub quantity: i32,
}

/// Buy-now or explicit-lines checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "at least one line is required"))]
    pub items: Vec<OrderLine>,
    #[validate]
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

/// Checkout of the caller's server cart.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutCartRequest {
    #[validate]
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

#[derive(Clone)]
pub struct OrderIntakeService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    pricing: Arc<dyn DeliveryPricing>,
    payments: PaymentService,
}

impl OrderIntakeService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        pricing: Arc<dyn DeliveryPricing>,
        payments: PaymentService,
    ) -> Self {
        Self {
            db,
            event_sender,
            pricing,
            payments,
        }
    }

    /// Creates an order from explicit lines (buy-now).
    #[instrument(skip(self, request), fields(actor_id = %actor.id, lines = request.items.len()))]
    pub async fn create_order(
        &self,
        actor: Actor,
        request: CreateOrderRequest,
    ) -> Result<OrderDetails, ServiceError> {
        actor.require_role(&[ActorRole::Customer], "place orders")?;
        request.validate()?;
        let lines = normalize_lines(&request.items)?;

        self.place_order(
            actor.id,
            LineSource::Explicit(lines),
            request.shipping_address,
            request.payment_method,
        )
        .await
    }

    /// Creates an order from the caller's cart and empties the cart in the
    /// same transaction.
    #[instrument(skip(self, request), fields(actor_id = %actor.id))]
    pub async fn checkout_cart(
        &self,
        actor: Actor,
        request: CheckoutCartRequest,
    ) -> Result<OrderDetails, ServiceError> {
        actor.require_role(&[ActorRole::Customer], "check out")?;
        request.validate()?;

        let cart = Cart::find()
            .filter(cart::Column::UserId.eq(actor.id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::ValidationError("cart is empty".to_string()))?;

        self.place_order(
            actor.id,
            LineSource::Cart(cart.id),
            request.shipping_address,
            request.payment_method,
        )
        .await
    }

    async fn place_order(
        &self,
        user_id: Uuid,
        source: LineSource,
        shipping_address: ShippingAddress,
        payment_method: PaymentMethod,
    ) -> Result<OrderDetails, ServiceError> {
        let address_json = serde_json::to_value(&shipping_address)
            .map_err(|e| ServiceError::InternalError(format!("address snapshot: {}", e)))?;

        let (order, items) = {
            let source = &source;
            let shipping_address = &shipping_address;
            let address_json = &address_json;
            with_retry(&RetryConfig::default(), move || {
                self.insert_order(user_id, source, shipping_address, address_json, payment_method)
            })
            .await?
        };

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            user_id = %user_id,
            total = %order.total,
            "Order created"
        );
        counter!("fulfillment.orders.created", 1);
        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
                user_id,
                total: order.total,
            })
            .await;

        // Committed: from here on the caller always gets the order back.
        let created = order.clone();
        match self.payments.start_payment(order).await {
            Ok(order) => Ok(OrderDetails { order, items }),
            Err(e) => {
                error!(
                    error = %e,
                    order_id = %created.id,
                    "Payment could not be started for a created order; it stays retryable"
                );
                counter!("fulfillment.orders.payment_start_failed", 1);
                match reload(&*self.db, created.id).await {
                    Ok(details) => Ok(details),
                    Err(reload_err) => {
                        warn!(error = %reload_err, order_id = %created.id, "Returning order as created");
                        Ok(OrderDetails {
                            order: created,
                            items,
                        })
                    }
                }
            }
        }
    }

    /// Reserves stock and writes the order with its items in one transaction.
    async fn insert_order(
        &self,
        user_id: Uuid,
        source: &LineSource,
        shipping_address: &ShippingAddress,
        address_json: &serde_json::Value,
        payment_method: PaymentMethod,
    ) -> Result<(order::Model, Vec<order_item::Model>), ServiceError> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = generate_order_number();

        let txn = self.db.begin().await?;

        let lines = match source {
            LineSource::Explicit(lines) => lines.clone(),
            LineSource::Cart(cart_id) => {
                let cart_lines: Vec<OrderLine> = CartItem::find()
                    .filter(cart_item::Column::CartId.eq(*cart_id))
                    .all(&txn)
                    .await?
                    .into_iter()
                    .map(|line| OrderLine {
                        variant_id: line.variant_id,
                        quantity: line.quantity,
                    })
                    .collect();
                if cart_lines.is_empty() {
                    return Err(ServiceError::ValidationError("cart is empty".to_string()));
                }
                normalize_lines(&cart_lines)?
            }
        };

        let mut snapshots = Vec::with_capacity(lines.len());
        for line in &lines {
            let variant = stock_ledger::reserve(&txn, line.variant_id, line.quantity)
                .await
                .map_err(|e| {
                    if !e.is_write_conflict() {
                        counter!("fulfillment.orders.rejected", 1, "reason" => e.code());
                    }
                    e
                })?;
            snapshots.push((variant, line.quantity));
        }

        let subtotal: Decimal = snapshots
            .iter()
            .map(|(variant, quantity)| variant.price * Decimal::from(*quantity))
            .sum();
        let delivery_charge = self
            .pricing
            .quote(&shipping_address.postal_code, subtotal);
        let total = subtotal + delivery_charge;

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            user_id: Set(user_id),
            payment_method: Set(payment_method),
            payment_status: Set(match payment_method {
                PaymentMethod::Cod => PaymentStatus::ConfirmedUnpaid,
                PaymentMethod::Online => PaymentStatus::Pending,
            }),
            is_paid: Set(false),
            paid_at: Set(None),
            payment_reference: Set(None),
            status: Set(OrderStatus::Pending),
            cancellation_reason: Set(None),
            cancelled_by: Set(None),
            cancelled_at: Set(None),
            delivery_agent_id: Set(None),
            assigned_at: Set(None),
            shipping_address: Set(address_json.clone()),
            subtotal: Set(subtotal),
            delivery_charge: Set(delivery_charge),
            total: Set(total),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order in database");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(snapshots.len());
        for (variant, quantity) in snapshots {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(variant.id),
                product_name: Set(variant.name),
                sku: Set(variant.sku),
                unit_price: Set(variant.price),
                quantity: Set(quantity),
                line_total: Set(variant.price * Decimal::from(quantity)),
                status: Set(FulfillmentStatus::Pending),
                picked_at: Set(None),
                packed_at: Set(None),
                shipped_at: Set(None),
                out_for_delivery_at: Set(None),
                delivered_at: Set(None),
                failed_at: Set(None),
                failure_reason: Set(None),
                otp_hash: Set(None),
                otp_status: Set(OtpStatus::NotSent),
                otp_expires_at: Set(None),
                otp_attempts: Set(0),
                allow_return: Set(variant.allow_return),
                return_days: Set(variant.return_days),
                allow_replacement: Set(variant.allow_replacement),
                replacement_days: Set(variant.replacement_days),
                version: Set(1),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        if let LineSource::Cart(cart_id) = source {
            CartItem::delete_many()
                .filter(cart_item::Column::CartId.eq(*cart_id))
                .exec(&txn)
                .await?;
            // Recorded merges describe a cart that no longer exists.
            GuestCartMerge::delete_many()
                .filter(guest_cart_merge::Column::UserId.eq(user_id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation transaction");
            ServiceError::DatabaseError(e)
        })?;

        Ok((order, items))
    }
}

/// Where the lines of a new order come from.
enum LineSource {
    Explicit(Vec<OrderLine>),
    /// The cart's lines, read and cleared inside the order transaction
    Cart(Uuid),
}

async fn reload(db: &DatabaseConnection, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
    let order = find_order(db, order_id, false).await?;
    let items = items_of(db, order_id, false).await?;
    Ok(OrderDetails { order, items })
}

/// Folds duplicate variants together and rejects non-positive quantities.
///
/// The result is ordered by variant id so concurrent checkouts touch stock
/// rows in the same order.
fn normalize_lines(lines: &[OrderLine]) -> Result<Vec<OrderLine>, ServiceError> {
    let mut merged: BTreeMap<Uuid, i32> = BTreeMap::new();
    for line in lines {
        if line.quantity < 1 {
            return Err(ServiceError::ValidationError(format!(
                "quantity for variant {} must be at least 1",
                line.variant_id
            )));
        }
        let entry = merged.entry(line.variant_id).or_insert(0);
        *entry = entry.checked_add(line.quantity).ok_or_else(|| {
            ServiceError::ValidationError(format!("quantity for variant {} is too large", line.variant_id))
        })?;
    }
    if merged.is_empty() {
        return Err(ServiceError::ValidationError(
            "at least one line is required".to_string(),
        ));
    }
    Ok(merged
        .into_iter()
        .map(|(variant_id, quantity)| OrderLine {
            variant_id,
            quantity,
        })
        .collect())
}

/// `ORD-YYYYMMDD-XXXXXX`
fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn duplicate_lines_are_folded() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let lines = normalize_lines(&[
            OrderLine { variant_id: a, quantity: 1 },
            OrderLine { variant_id: b, quantity: 2 },
            OrderLine { variant_id: a, quantity: 3 },
        ])
        .unwrap();
        assert_eq!(lines.len(), 2);
        let qty_a = lines.iter().find(|l| l.variant_id == a).unwrap().quantity;
        assert_eq!(qty_a, 4);
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let result = normalize_lines(&[OrderLine {
            variant_id: Uuid::new_v4(),
            quantity: 0,
        }]);
        assert_matches!(result, Err(ServiceError::ValidationError(_)));
        assert_matches!(normalize_lines(&[]), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn order_numbers_follow_format() {
        let number = generate_order_number();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
