//! Payment Adjudicator.
//!
//! Records orders as paid or unpaid on top of an opaque gateway collaborator.
//! The order row always exists before any gateway call, so a gateway failure
//! leaves a `pending`/`failed` order that can retry payment, never a torn one.

use crate::auth::{Actor, ActorRole};
use crate::db;
use crate::entities::order::{self, Entity as Order, PaymentMethod, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::retry::{with_retry, RetryConfig};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, QuerySelect, Set};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Gateway-side handle for an initiated payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub gateway_order_id: String,
}

/// Payload the client relays back from the gateway after checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentConfirmation {
    pub gateway_payment_id: String,
    #[serde(default)]
    pub gateway_order_id: Option<String>,
    pub signature: String,
}

/// Instruction handed to the refund collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundInstruction {
    pub return_id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub payment_reference: Option<String>,
    pub user_upi: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a payment for the order's total at the gateway.
    async fn initiate(&self, order: &order::Model) -> Result<PaymentIntent, ServiceError>;

    /// Checks that `confirmation` was issued by the gateway for `gateway_order_id`.
    fn verify(
        &self,
        gateway_order_id: &str,
        confirmation: &PaymentConfirmation,
    ) -> Result<bool, ServiceError>;
}

#[async_trait]
pub trait RefundGateway: Send + Sync {
    /// Issues the refund and returns the collaborator's reference for it.
    async fn refund(&self, instruction: &RefundInstruction) -> Result<String, ServiceError>;
}

/// Gateway that verifies `HMAC-SHA256(secret, "{gateway_order_id}|{payment_id}")`
/// signatures, the scheme used by hosted-checkout gateways.
#[derive(Clone)]
pub struct SignatureGateway {
    secret: String,
}

impl SignatureGateway {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hex signature the gateway attaches to a successful payment.
    pub fn sign(&self, gateway_order_id: &str, gateway_payment_id: &str) -> Result<String, ServiceError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid payment secret: {}", e)))?;
        mac.update(format!("{}|{}", gateway_order_id, gateway_payment_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl PaymentGateway for SignatureGateway {
    async fn initiate(&self, order: &order::Model) -> Result<PaymentIntent, ServiceError> {
        let gateway_order_id = format!("gw_{}", Uuid::new_v4().simple());
        info!(
            order_number = %order.order_number,
            gateway_order_id = %gateway_order_id,
            amount = %order.total,
            "Payment initiated"
        );
        Ok(PaymentIntent { gateway_order_id })
    }

    fn verify(
        &self,
        gateway_order_id: &str,
        confirmation: &PaymentConfirmation,
    ) -> Result<bool, ServiceError> {
        let Ok(signature) = hex::decode(confirmation.signature.trim()) else {
            return Ok(false);
        };
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| ServiceError::InternalError(format!("invalid payment secret: {}", e)))?;
        mac.update(format!("{}|{}", gateway_order_id, confirmation.gateway_payment_id).as_bytes());
        Ok(mac.verify_slice(&signature).is_ok())
    }
}

/// Refund collaborator that only records the instruction. Stands in until a
/// real payout integration is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingRefundGateway;

#[async_trait]
impl RefundGateway for LoggingRefundGateway {
    async fn refund(&self, instruction: &RefundInstruction) -> Result<String, ServiceError> {
        let reference = format!("rf_{}", Uuid::new_v4().simple());
        info!(
            return_id = %instruction.return_id,
            amount = %instruction.amount,
            refund_reference = %reference,
            "Refund issued"
        );
        Ok(reference)
    }
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
        }
    }

    /// Opens a gateway payment for a freshly created or previously failed
    /// online order. Gateway errors are recorded on the order, which stays
    /// unpaid and retryable.
    #[instrument(skip(self, order), fields(order_number = %order.order_number))]
    pub async fn start_payment(&self, order: order::Model) -> Result<order::Model, ServiceError> {
        if order.payment_method != PaymentMethod::Online || order.is_paid {
            return Ok(order);
        }

        match self.gateway.initiate(&order).await {
            Ok(intent) => {
                let updated = order
                    .apply(
                        &*self.db,
                        order::ActiveModel {
                            payment_status: Set(PaymentStatus::Pending),
                            payment_reference: Set(Some(intent.gateway_order_id)),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(updated)
            }
            Err(e) => {
                warn!(error = %e, "Payment initiation failed; order left unpaid");
                counter!("fulfillment.payments.initiation_failed", 1);
                let updated = order
                    .apply(
                        &*self.db,
                        order::ActiveModel {
                            payment_status: Set(PaymentStatus::Failed),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        order_id: updated.id,
                        reason: e.to_string(),
                    })
                    .await;
                Ok(updated)
            }
        }
    }

    /// Re-initiates payment against the same order.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn retry_payment(
        &self,
        actor: Actor,
        order_number: &str,
    ) -> Result<order::Model, ServiceError> {
        actor.require_role(&[ActorRole::Customer, ActorRole::Admin], "retry payment")?;
        let order = self.find_order(order_number).await?;
        actor.require_owner(order.user_id, "order")?;

        if order.payment_method != PaymentMethod::Online {
            return Err(ServiceError::ValidationError(
                "cash-on-delivery orders are paid at handover".to_string(),
            ));
        }
        if order.is_paid {
            return Ok(order);
        }
        if order.is_cancelled() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is cancelled",
                order.order_number
            )));
        }

        self.start_payment(order).await
    }

    /// Confirms an online payment. Idempotent once the order is paid.
    #[instrument(skip(self, confirmation), fields(actor_id = %actor.id))]
    pub async fn verify_payment(
        &self,
        actor: Actor,
        order_number: &str,
        confirmation: PaymentConfirmation,
    ) -> Result<order::Model, ServiceError> {
        actor.require_role(&[ActorRole::Customer, ActorRole::Admin], "verify payment")?;
        let order = self.find_order(order_number).await?;
        actor.require_owner(order.user_id, "order")?;

        if order.is_paid {
            return Ok(order);
        }
        if order.payment_method != PaymentMethod::Online {
            return Err(ServiceError::ValidationError(
                "cash-on-delivery orders are paid at handover".to_string(),
            ));
        }
        if order.is_cancelled() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is cancelled",
                order.order_number
            )));
        }

        let reference = order.payment_reference.clone().ok_or_else(|| {
            ServiceError::InvalidTransition(format!(
                "no payment has been initiated for order {}",
                order.order_number
            ))
        })?;
        if let Some(claimed) = confirmation.gateway_order_id.as_deref() {
            if claimed != reference {
                return Err(ServiceError::ValidationError(
                    "payment confirmation belongs to a different gateway order".to_string(),
                ));
            }
        }

        if !self.gateway.verify(&reference, &confirmation)? {
            counter!("fulfillment.payments.verification_failed", 1);
            let failed = order
                .apply(
                    &*self.db,
                    order::ActiveModel {
                        payment_status: Set(PaymentStatus::Failed),
                        ..Default::default()
                    },
                )
                .await?;
            self.event_sender
                .send_or_log(Event::PaymentFailed {
                    order_id: failed.id,
                    reason: "signature mismatch".to_string(),
                })
                .await;
            return Err(ServiceError::PaymentFailed(format!(
                "payment for order {} could not be verified",
                failed.order_number
            )));
        }

        let order_id = order.id;
        let paid = with_retry(&RetryConfig::default(), move || {
            db::transaction(&self.db, move |txn| {
                Box::pin(async move {
                    let current = Order::find_by_id(order_id)
                        .lock_exclusive()
                        .one(txn)
                        .await?
                        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
                    if current.is_paid {
                        return Ok(current);
                    }
                    mark_paid(txn, &current).await
                })
            })
        })
        .await?;

        info!(
            order_number = %paid.order_number,
            gateway_payment_id = %confirmation.gateway_payment_id,
            "Order paid"
        );
        counter!("fulfillment.payments.confirmed", 1);
        self.event_sender
            .send_or_log(Event::OrderPaid {
                order_id: paid.id,
                payment_reference: paid.payment_reference.clone(),
            })
            .await;
        Ok(paid)
    }

    async fn find_order(&self, order_number: &str) -> Result<order::Model, ServiceError> {
        Order::find_by_number(order_number)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }
}

/// Marks an order paid inside the caller's transaction.
///
/// Used for online confirmations and for cash-on-delivery orders once their
/// last item is handed over.
pub(crate) async fn mark_paid<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
) -> Result<order::Model, ServiceError> {
    order
        .apply(
            conn,
            order::ActiveModel {
                is_paid: Set(true),
                paid_at: Set(Some(Utc::now())),
                payment_status: Set(PaymentStatus::Paid),
                ..Default::default()
            },
        )
        .await
}
