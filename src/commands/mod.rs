//! Closed set of workflow commands.
//!
//! Every boundary operation has exactly one variant carrying only the fields
//! its guard needs. Commands arrive as JSON tagged by `action` and are routed
//! to the owning service by [`CommandDispatcher`].

use crate::auth::Actor;
use crate::entities::{
    order_item::FulfillmentStatus,
    return_request::{Decision, PickupStatus},
};
use crate::errors::ServiceError;
use crate::handlers::AppServices;
use crate::services::cart_reconciler::{GuestCartEntry, ReconcileRequest};
use crate::services::order_intake::{CheckoutCartRequest, CreateOrderRequest};
use crate::services::payments::PaymentConfirmation;
use crate::services::remediation::{CreateReplacementRequest, CreateReturnRequest, RemediationKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkflowCommand {
    ReconcileGuestCart {
        items: Vec<GuestCartEntry>,
        #[serde(default)]
        merge_token: Option<String>,
    },
    CreateOrder(CreateOrderRequest),
    CheckoutCart(CheckoutCartRequest),
    VerifyPayment {
        order_number: String,
        confirmation: PaymentConfirmation,
    },
    RetryPayment {
        order_number: String,
    },
    AdvanceItem {
        item_id: Uuid,
        target: FulfillmentStatus,
    },
    CancelOrder {
        order_number: String,
        reason: String,
    },
    AssignDeliveryAgent {
        order_number: String,
        agent_id: Uuid,
    },
    MarkDeliveryFailed {
        item_id: Uuid,
        reason: String,
    },
    RescheduleDelivery {
        item_id: Uuid,
    },
    SendOtp {
        item_id: Uuid,
    },
    ResendOtp {
        item_id: Uuid,
    },
    VerifyOtp {
        item_id: Uuid,
        code: String,
    },
    CreateReturn(CreateReturnRequest),
    CreateReplacement(CreateReplacementRequest),
    DecidePickup {
        kind: RemediationKind,
        request_id: Uuid,
        outcome: PickupStatus,
        #[serde(default)]
        comment: Option<String>,
    },
    DecideWarehouse {
        kind: RemediationKind,
        request_id: Uuid,
        decision: Decision,
        comment: String,
    },
    DecideAdmin {
        kind: RemediationKind,
        request_id: Uuid,
        decision: Decision,
        comment: String,
        #[serde(default)]
        refund_amount: Option<Decimal>,
    },
    RetryRefund {
        return_id: Uuid,
    },
}

impl WorkflowCommand {
    /// Action tag, as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReconcileGuestCart { .. } => "reconcile_guest_cart",
            Self::CreateOrder(_) => "create_order",
            Self::CheckoutCart(_) => "checkout_cart",
            Self::VerifyPayment { .. } => "verify_payment",
            Self::RetryPayment { .. } => "retry_payment",
            Self::AdvanceItem { .. } => "advance_item",
            Self::CancelOrder { .. } => "cancel_order",
            Self::AssignDeliveryAgent { .. } => "assign_delivery_agent",
            Self::MarkDeliveryFailed { .. } => "mark_delivery_failed",
            Self::RescheduleDelivery { .. } => "reschedule_delivery",
            Self::SendOtp { .. } => "send_otp",
            Self::ResendOtp { .. } => "resend_otp",
            Self::VerifyOtp { .. } => "verify_otp",
            Self::CreateReturn(_) => "create_return",
            Self::CreateReplacement(_) => "create_replacement",
            Self::DecidePickup { .. } => "decide_pickup",
            Self::DecideWarehouse { .. } => "decide_warehouse",
            Self::DecideAdmin { .. } => "decide_admin",
            Self::RetryRefund { .. } => "retry_refund",
        }
    }
}

/// Routes a [`WorkflowCommand`] to the service that owns it.
#[derive(Clone)]
pub struct CommandDispatcher {
    services: AppServices,
}

impl CommandDispatcher {
    pub fn new(services: AppServices) -> Self {
        Self { services }
    }

    #[instrument(skip(self, command), fields(actor_id = %actor.id, action = command.name()))]
    pub async fn dispatch(&self, actor: Actor, command: WorkflowCommand) -> Result<Value, ServiceError> {
        let action = command.name();
        let services = &self.services;

        let result = match command {
            WorkflowCommand::ReconcileGuestCart { items, merge_token } => to_json(
                services
                    .carts
                    .reconcile(actor, ReconcileRequest { items, merge_token })
                    .await?,
            ),
            WorkflowCommand::CreateOrder(request) => {
                to_json(services.intake.create_order(actor, request).await?)
            }
            WorkflowCommand::CheckoutCart(request) => {
                to_json(services.intake.checkout_cart(actor, request).await?)
            }
            WorkflowCommand::VerifyPayment {
                order_number,
                confirmation,
            } => to_json(
                services
                    .payments
                    .verify_payment(actor, &order_number, confirmation)
                    .await?,
            ),
            WorkflowCommand::RetryPayment { order_number } => {
                to_json(services.payments.retry_payment(actor, &order_number).await?)
            }
            WorkflowCommand::AdvanceItem { item_id, target } => {
                to_json(services.fulfillment.advance_item(actor, item_id, target).await?)
            }
            WorkflowCommand::CancelOrder {
                order_number,
                reason,
            } => to_json(
                services
                    .fulfillment
                    .cancel_order(actor, &order_number, &reason)
                    .await?,
            ),
            WorkflowCommand::AssignDeliveryAgent {
                order_number,
                agent_id,
            } => to_json(
                services
                    .fulfillment
                    .assign_delivery_agent(actor, &order_number, agent_id)
                    .await?,
            ),
            WorkflowCommand::MarkDeliveryFailed { item_id, reason } => to_json(
                services
                    .fulfillment
                    .mark_delivery_failed(actor, item_id, &reason)
                    .await?,
            ),
            WorkflowCommand::RescheduleDelivery { item_id } => {
                to_json(services.fulfillment.reschedule_delivery(actor, item_id).await?)
            }
            WorkflowCommand::SendOtp { item_id } => {
                to_json(services.delivery.send_otp(actor, item_id).await?)
            }
            WorkflowCommand::ResendOtp { item_id } => {
                to_json(services.delivery.resend_otp(actor, item_id).await?)
            }
            WorkflowCommand::VerifyOtp { item_id, code } => {
                to_json(services.delivery.verify_otp(actor, item_id, &code).await?)
            }
            WorkflowCommand::CreateReturn(request) => {
                to_json(services.remediation.create_return(actor, request).await?)
            }
            WorkflowCommand::CreateReplacement(request) => {
                to_json(services.remediation.create_replacement(actor, request).await?)
            }
            WorkflowCommand::DecidePickup {
                kind,
                request_id,
                outcome,
                comment,
            } => to_json(
                services
                    .remediation
                    .decide_pickup(actor, kind, request_id, outcome, comment)
                    .await?,
            ),
            WorkflowCommand::DecideWarehouse {
                kind,
                request_id,
                decision,
                comment,
            } => to_json(
                services
                    .remediation
                    .decide_warehouse(actor, kind, request_id, decision, &comment)
                    .await?,
            ),
            WorkflowCommand::DecideAdmin {
                kind,
                request_id,
                decision,
                comment,
                refund_amount,
            } => to_json(
                services
                    .remediation
                    .decide_admin(actor, kind, request_id, decision, &comment, refund_amount)
                    .await?,
            ),
            WorkflowCommand::RetryRefund { return_id } => {
                to_json(services.remediation.retry_refund(actor, return_id).await?)
            }
        }?;

        info!(action, "Workflow command executed");
        Ok(result)
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, ServiceError> {
    serde_json::to_value(value)
        .map_err(|e| ServiceError::InternalError(format!("failed to serialize result: {}", e)))
}
