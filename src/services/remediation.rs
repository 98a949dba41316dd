//! Remediation Workflow: returns and replacements.
//!
//! Both kinds share one sign-off sequence: the assigned delivery agent
//! records the pickup, the warehouse inspects it, and an admin makes the
//! final call. Returns additionally carry a refund amount and end once the
//! refund collaborator confirms the payout. A payout is claimed on the row
//! (`refunding`) before the collaborator is called, so it happens at most once.

use crate::auth::{Actor, ActorRole};
use crate::entities::{
    order::PaymentMethod,
    order_item::{self, FulfillmentStatus},
    replacement_request::{self, Entity as ReplacementRequest},
    return_request::{
        self, Decision, Entity as ReturnRequest, PickupStatus, RefundMethod, RequestStatus,
    },
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender, RemediationStage};
use crate::retry::{with_retry, RetryConfig};
use crate::services::fulfillment::{lock_order_and_item, require_assigned_agent};
use crate::services::payments::{RefundGateway, RefundInstruction};
use crate::services::{find_item, find_order};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemediationKind {
    Return,
    Replacement,
}

/// Either kind of request, as returned by the shared stage operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "request", rename_all = "snake_case")]
pub enum RemediationRequest {
    Return(return_request::Model),
    Replacement(replacement_request::Model),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateReturnRequest {
    pub order_item_id: Uuid,
    #[validate(length(min = 1, max = 1000, message = "a reason is required"))]
    pub reason: String,
    /// Payout handle for cash-on-delivery orders
    #[validate(length(min = 3, max = 100))]
    pub user_upi: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateReplacementRequest {
    pub order_item_id: Uuid,
    #[validate(length(min = 1, max = 1000, message = "a reason is required"))]
    pub reason: String,
}

/// Current sign-off position of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub status: RequestStatus,
    pub pickup: PickupStatus,
    pub warehouse: Decision,
    pub admin: Decision,
}

#[derive(Debug, Clone)]
enum StageChange {
    Pickup {
        outcome: PickupStatus,
        comment: Option<String>,
    },
    Warehouse {
        decision: Decision,
        comment: String,
    },
    Admin {
        decision: Decision,
        comment: String,
        refund_amount: Option<Decimal>,
    },
}

impl StageChange {
    fn resulting_status(&self) -> RequestStatus {
        match self {
            Self::Pickup { .. } => RequestStatus::InProgress,
            Self::Warehouse { decision, .. } => match decision {
                Decision::Rejected => RequestStatus::Rejected,
                _ => RequestStatus::InProgress,
            },
            Self::Admin { decision, .. } => match decision {
                Decision::Rejected => RequestStatus::Rejected,
                _ => RequestStatus::Approved,
            },
        }
    }
}

/// Persistence seam shared by return and replacement rows.
#[async_trait]
trait StagedRequest: Sized + Send + Sync {
    const KIND: RemediationKind;

    async fn lock(txn: &DatabaseTransaction, id: Uuid) -> Result<Self, ServiceError>;
    async fn record(&self, txn: &DatabaseTransaction, change: StageChange) -> Result<Self, ServiceError>;
    fn id(&self) -> Uuid;
    fn order_id(&self) -> Uuid;
    fn order_item_id(&self) -> Uuid;
    fn stages(&self) -> Stages;
    fn decided_event(&self, stage: RemediationStage, decision: Decision) -> Event;
    fn into_request(self) -> RemediationRequest;
}

#[async_trait]
impl StagedRequest for return_request::Model {
    const KIND: RemediationKind = RemediationKind::Return;

    async fn lock(txn: &DatabaseTransaction, id: Uuid) -> Result<Self, ServiceError> {
        find_return(txn, id, true).await
    }

    async fn record(&self, txn: &DatabaseTransaction, change: StageChange) -> Result<Self, ServiceError> {
        let now = Utc::now();
        let mut changes = return_request::ActiveModel {
            status: Set(change.resulting_status()),
            ..Default::default()
        };
        match change {
            StageChange::Pickup { outcome, comment } => {
                changes.pickup_status = Set(outcome);
                changes.pickup_comment = Set(comment);
                changes.pickup_at = Set(Some(now));
            }
            StageChange::Warehouse { decision, comment } => {
                changes.warehouse_status = Set(decision);
                changes.warehouse_comment = Set(Some(comment));
                changes.warehouse_decided_at = Set(Some(now));
            }
            StageChange::Admin {
                decision,
                comment,
                refund_amount,
            } => {
                changes.admin_status = Set(decision);
                changes.admin_comment = Set(Some(comment));
                changes.admin_decided_at = Set(Some(now));
                changes.refund_amount = Set(refund_amount);
            }
        }
        self.apply(txn, changes).await
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn order_id(&self) -> Uuid {
        self.order_id
    }

    fn order_item_id(&self) -> Uuid {
        self.order_item_id
    }

    fn stages(&self) -> Stages {
        Stages {
            status: self.status,
            pickup: self.pickup_status,
            warehouse: self.warehouse_status,
            admin: self.admin_status,
        }
    }

    fn decided_event(&self, stage: RemediationStage, decision: Decision) -> Event {
        Event::ReturnDecided {
            return_id: self.id,
            stage,
            decision,
        }
    }

    fn into_request(self) -> RemediationRequest {
        RemediationRequest::Return(self)
    }
}

#[async_trait]
impl StagedRequest for replacement_request::Model {
    const KIND: RemediationKind = RemediationKind::Replacement;

    async fn lock(txn: &DatabaseTransaction, id: Uuid) -> Result<Self, ServiceError> {
        find_replacement(txn, id, true).await
    }

    async fn record(&self, txn: &DatabaseTransaction, change: StageChange) -> Result<Self, ServiceError> {
        let now = Utc::now();
        let mut changes = replacement_request::ActiveModel {
            status: Set(change.resulting_status()),
            ..Default::default()
        };
        match change {
            StageChange::Pickup { outcome, comment } => {
                changes.pickup_status = Set(outcome);
                changes.pickup_comment = Set(comment);
                changes.pickup_at = Set(Some(now));
            }
            StageChange::Warehouse { decision, comment } => {
                changes.warehouse_status = Set(decision);
                changes.warehouse_comment = Set(Some(comment));
                changes.warehouse_decided_at = Set(Some(now));
            }
            StageChange::Admin { decision, comment, .. } => {
                changes.admin_status = Set(decision);
                changes.admin_comment = Set(Some(comment));
                changes.admin_decided_at = Set(Some(now));
            }
        }
        self.apply(txn, changes).await
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn order_id(&self) -> Uuid {
        self.order_id
    }

    fn order_item_id(&self) -> Uuid {
        self.order_item_id
    }

    fn stages(&self) -> Stages {
        Stages {
            status: self.status,
            pickup: self.pickup_status,
            warehouse: self.warehouse_status,
            admin: self.admin_status,
        }
    }

    fn decided_event(&self, stage: RemediationStage, decision: Decision) -> Event {
        Event::ReplacementDecided {
            replacement_id: self.id,
            stage,
            decision,
        }
    }

    fn into_request(self) -> RemediationRequest {
        RemediationRequest::Replacement(self)
    }
}

#[derive(Clone)]
pub struct RemediationService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    refunds: Arc<dyn RefundGateway>,
}

impl RemediationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        refunds: Arc<dyn RefundGateway>,
    ) -> Self {
        Self {
            db,
            event_sender,
            refunds,
        }
    }

    /// Opens a return on a delivered item inside its return window.
    #[instrument(skip(self, request), fields(actor_id = %actor.id, order_item_id = %request.order_item_id))]
    pub async fn create_return(
        &self,
        actor: Actor,
        request: CreateReturnRequest,
    ) -> Result<return_request::Model, ServiceError> {
        let request = &request;
        with_retry(&RetryConfig::default(), move || {
            self.create_return_inner(actor, request)
        })
        .await
    }

    async fn create_return_inner(
        &self,
        actor: Actor,
        request: &CreateReturnRequest,
    ) -> Result<return_request::Model, ServiceError> {
        actor.require_role(&[ActorRole::Customer], "request returns")?;
        request.validate()?;
        let reason = required_text(&request.reason, "a reason is required")?;

        let txn = self.db.begin().await?;
        let (order, item) = lock_order_and_item(&txn, request.order_item_id).await?;
        actor.require_owner(order.user_id, "order item")?;
        check_eligibility(&item, RemediationKind::Return, Utc::now())?;

        let has_active = ReturnRequest::find()
            .filter(return_request::Column::OrderItemId.eq(item.id))
            .all(&txn)
            .await?
            .iter()
            .any(|existing| existing.status.is_active());
        if has_active {
            return Err(ServiceError::NotEligible(format!(
                "item {} already has an active return",
                item.id
            )));
        }

        let (refund_method, user_upi) = match order.payment_method {
            PaymentMethod::Online => (RefundMethod::OriginalPayment, None),
            PaymentMethod::Cod => {
                let upi = request
                    .user_upi
                    .as_deref()
                    .map(str::trim)
                    .filter(|upi| !upi.is_empty())
                    .ok_or_else(|| {
                        ServiceError::ValidationError(
                            "a UPI id is required to refund cash-on-delivery orders".to_string(),
                        )
                    })?;
                (RefundMethod::Upi, Some(upi.to_string()))
            }
        };

        let now = Utc::now();
        let created = return_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_item_id: Set(item.id),
            order_id: Set(order.id),
            user_id: Set(actor.id),
            reason: Set(reason),
            status: Set(RequestStatus::Pending),
            pickup_status: Set(PickupStatus::Pending),
            pickup_comment: Set(None),
            pickup_at: Set(None),
            warehouse_status: Set(Decision::Pending),
            warehouse_comment: Set(None),
            warehouse_decided_at: Set(None),
            admin_status: Set(Decision::Pending),
            admin_comment: Set(None),
            admin_decided_at: Set(None),
            refund_amount: Set(None),
            refund_method: Set(refund_method),
            user_upi: Set(user_upi),
            refund_reference: Set(None),
            refunded_at: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        info!(return_id = %created.id, order_item_id = %item.id, refund_method = %refund_method, "Return requested");
        counter!("fulfillment.returns.created", 1);
        self.event_sender
            .send_or_log(Event::ReturnCreated {
                return_id: created.id,
                order_item_id: item.id,
            })
            .await;
        Ok(created)
    }

    /// Opens a replacement on a delivered item inside its replacement window.
    #[instrument(skip(self, request), fields(actor_id = %actor.id, order_item_id = %request.order_item_id))]
    pub async fn create_replacement(
        &self,
        actor: Actor,
        request: CreateReplacementRequest,
    ) -> Result<replacement_request::Model, ServiceError> {
        let request = &request;
        with_retry(&RetryConfig::default(), move || {
            self.create_replacement_inner(actor, request)
        })
        .await
    }

    async fn create_replacement_inner(
        &self,
        actor: Actor,
        request: &CreateReplacementRequest,
    ) -> Result<replacement_request::Model, ServiceError> {
        actor.require_role(&[ActorRole::Customer], "request replacements")?;
        request.validate()?;
        let reason = required_text(&request.reason, "a reason is required")?;

        let txn = self.db.begin().await?;
        let (order, item) = lock_order_and_item(&txn, request.order_item_id).await?;
        actor.require_owner(order.user_id, "order item")?;
        check_eligibility(&item, RemediationKind::Replacement, Utc::now())?;

        let has_active = ReplacementRequest::find()
            .filter(replacement_request::Column::OrderItemId.eq(item.id))
            .all(&txn)
            .await?
            .iter()
            .any(|existing| existing.status.is_active());
        if has_active {
            return Err(ServiceError::NotEligible(format!(
                "item {} already has an active replacement",
                item.id
            )));
        }

        let now = Utc::now();
        let created = replacement_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_item_id: Set(item.id),
            order_id: Set(order.id),
            user_id: Set(actor.id),
            reason: Set(reason),
            status: Set(RequestStatus::Pending),
            pickup_status: Set(PickupStatus::Pending),
            pickup_comment: Set(None),
            pickup_at: Set(None),
            warehouse_status: Set(Decision::Pending),
            warehouse_comment: Set(None),
            warehouse_decided_at: Set(None),
            admin_status: Set(Decision::Pending),
            admin_comment: Set(None),
            admin_decided_at: Set(None),
            version: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        info!(replacement_id = %created.id, order_item_id = %item.id, "Replacement requested");
        counter!("fulfillment.replacements.created", 1);
        self.event_sender
            .send_or_log(Event::ReplacementCreated {
                replacement_id: created.id,
                order_item_id: item.id,
            })
            .await;
        Ok(created)
    }

    /// Delivery agent records whether the item was collected from the customer.
    #[instrument(skip(self, comment), fields(actor_id = %actor.id))]
    pub async fn decide_pickup(
        &self,
        actor: Actor,
        kind: RemediationKind,
        request_id: Uuid,
        outcome: PickupStatus,
        comment: Option<String>,
    ) -> Result<RemediationRequest, ServiceError> {
        let comment = comment.as_deref();
        let retry = RetryConfig::default();
        match kind {
            RemediationKind::Return => with_retry(&retry, move || {
                self.record_pickup::<return_request::Model>(actor, request_id, outcome, comment)
            })
            .await
            .map(StagedRequest::into_request),
            RemediationKind::Replacement => with_retry(&retry, move || {
                self.record_pickup::<replacement_request::Model>(actor, request_id, outcome, comment)
            })
            .await
            .map(StagedRequest::into_request),
        }
    }

    /// Warehouse inspection verdict. The comment is mandatory.
    #[instrument(skip(self, comment), fields(actor_id = %actor.id))]
    pub async fn decide_warehouse(
        &self,
        actor: Actor,
        kind: RemediationKind,
        request_id: Uuid,
        decision: Decision,
        comment: &str,
    ) -> Result<RemediationRequest, ServiceError> {
        let retry = RetryConfig::default();
        match kind {
            RemediationKind::Return => with_retry(&retry, move || {
                self.record_warehouse::<return_request::Model>(actor, request_id, decision, comment)
            })
            .await
            .map(StagedRequest::into_request),
            RemediationKind::Replacement => with_retry(&retry, move || {
                self.record_warehouse::<replacement_request::Model>(actor, request_id, decision, comment)
            })
            .await
            .map(StagedRequest::into_request),
        }
    }

    /// Final admin verdict. Approving a return needs a refund amount and
    /// triggers the refund; a refund failure leaves the return approved and
    /// retryable through [`RemediationService::retry_refund`].
    #[instrument(skip(self, comment), fields(actor_id = %actor.id))]
    pub async fn decide_admin(
        &self,
        actor: Actor,
        kind: RemediationKind,
        request_id: Uuid,
        decision: Decision,
        comment: &str,
        refund_amount: Option<Decimal>,
    ) -> Result<RemediationRequest, ServiceError> {
        let retry = RetryConfig::default();
        match kind {
            RemediationKind::Return => {
                let decided = with_retry(&retry, move || {
                    self.record_admin::<return_request::Model>(
                        actor,
                        request_id,
                        decision,
                        comment,
                        refund_amount,
                    )
                })
                .await?;
                if !decided.awaiting_refund() {
                    return Ok(RemediationRequest::Return(decided));
                }
                match self.settle_refund(decided.id).await {
                    Ok(refunded) => Ok(RemediationRequest::Return(refunded)),
                    Err(e) => {
                        warn!(
                            return_id = %decided.id,
                            error = %e,
                            "Refund not completed after approval"
                        );
                        let current = find_return(&*self.db, decided.id, false)
                            .await
                            .unwrap_or(decided);
                        Ok(RemediationRequest::Return(current))
                    }
                }
            }
            RemediationKind::Replacement => {
                if refund_amount.is_some() {
                    return Err(ServiceError::ValidationError(
                        "refund amounts apply to returns only".to_string(),
                    ));
                }
                with_retry(&retry, move || {
                    self.record_admin::<replacement_request::Model>(
                        actor, request_id, decision, comment, None,
                    )
                })
                .await
                .map(StagedRequest::into_request)
            }
        }
    }

    /// Re-invokes the refund collaborator for an approved, unrefunded return.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn retry_refund(
        &self,
        actor: Actor,
        return_id: Uuid,
    ) -> Result<return_request::Model, ServiceError> {
        actor.require_role(&[ActorRole::Admin], "retry refunds")?;
        self.settle_refund(return_id).await
    }

    /// Request visible to its owner, staff, and the agent assigned to its order.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn get_return(&self, actor: Actor, return_id: Uuid) -> Result<return_request::Model, ServiceError> {
        let request = find_return(&*self.db, return_id, false).await?;
        self.authorize_read(&actor, request.user_id, request.order_id, "return")
            .await?;
        Ok(request)
    }

    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn get_replacement(
        &self,
        actor: Actor,
        replacement_id: Uuid,
    ) -> Result<replacement_request::Model, ServiceError> {
        let request = find_replacement(&*self.db, replacement_id, false).await?;
        self.authorize_read(&actor, request.user_id, request.order_id, "replacement")
            .await?;
        Ok(request)
    }

    async fn authorize_read(
        &self,
        actor: &Actor,
        owner_id: Uuid,
        order_id: Uuid,
        resource: &str,
    ) -> Result<(), ServiceError> {
        match actor.role {
            ActorRole::Customer => actor.require_owner(owner_id, resource),
            ActorRole::DeliveryAgent => {
                let order = find_order(&*self.db, order_id, false).await?;
                require_assigned_agent(actor, &order)
            }
            ActorRole::Warehouse | ActorRole::Admin => Ok(()),
        }
    }

    async fn record_pickup<R: StagedRequest>(
        &self,
        actor: Actor,
        request_id: Uuid,
        outcome: PickupStatus,
        comment: Option<&str>,
    ) -> Result<R, ServiceError> {
        actor.require_role(&[ActorRole::DeliveryAgent], "record pickups")?;
        let comment = comment
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let txn = self.db.begin().await?;
        let request = R::lock(&txn, request_id).await?;
        let order = find_order(&txn, request.order_id(), false).await?;
        require_assigned_agent(&actor, &order)?;
        check_pickup(request.stages(), outcome)?;

        let updated = request
            .record(&txn, StageChange::Pickup { outcome, comment })
            .await?;
        txn.commit().await?;

        let decision = match outcome {
            PickupStatus::Collected => Decision::Approved,
            _ => Decision::Rejected,
        };
        self.announce(&updated, RemediationStage::Pickup, decision).await;
        Ok(updated)
    }

    async fn record_warehouse<R: StagedRequest>(
        &self,
        actor: Actor,
        request_id: Uuid,
        decision: Decision,
        comment: &str,
    ) -> Result<R, ServiceError> {
        actor.require_role(&[ActorRole::Warehouse], "record warehouse decisions")?;
        let comment = required_text(comment, "a warehouse comment is required")?;

        let txn = self.db.begin().await?;
        let request = R::lock(&txn, request_id).await?;
        check_warehouse(request.stages(), decision)?;

        let updated = request
            .record(&txn, StageChange::Warehouse { decision, comment })
            .await?;
        txn.commit().await?;

        self.announce(&updated, RemediationStage::Warehouse, decision).await;
        Ok(updated)
    }

    async fn record_admin<R: StagedRequest>(
        &self,
        actor: Actor,
        request_id: Uuid,
        decision: Decision,
        comment: &str,
        refund_amount: Option<Decimal>,
    ) -> Result<R, ServiceError> {
        actor.require_role(&[ActorRole::Admin], "record admin decisions")?;
        let comment = required_text(comment, "an admin comment is required")?;

        let txn = self.db.begin().await?;
        let request = R::lock(&txn, request_id).await?;
        check_admin(request.stages(), decision)?;

        let refund_amount = if R::KIND == RemediationKind::Return && decision == Decision::Approved {
            let item = find_item(&txn, request.order_item_id(), false).await?;
            Some(check_refund_amount(refund_amount, item.line_total)?)
        } else {
            None
        };

        let updated = request
            .record(
                &txn,
                StageChange::Admin {
                    decision,
                    comment,
                    refund_amount,
                },
            )
            .await?;
        txn.commit().await?;

        self.announce(&updated, RemediationStage::Admin, decision).await;
        Ok(updated)
    }

    async fn announce<R: StagedRequest>(&self, request: &R, stage: RemediationStage, decision: Decision) {
        info!(
            kind = %R::KIND,
            request_id = %request.id(),
            stage = %stage,
            decision = %decision,
            "Remediation stage recorded"
        );
        counter!(
            "fulfillment.remediation.decisions",
            1,
            "kind" => R::KIND.to_string(),
            "stage" => stage.to_string()
        );
        self.event_sender
            .send_or_log(request.decided_event(stage, decision))
            .await;
    }

    /// Pays out an approved return: claim, call the collaborator, then
    /// record the reference. A failed payout releases the claim.
    async fn settle_refund(&self, return_id: Uuid) -> Result<return_request::Model, ServiceError> {
        let retry = RetryConfig::default();
        let instruction = with_retry(&retry, move || self.claim_refund(return_id)).await?;

        let reference = match self.refunds.refund(&instruction).await {
            Ok(reference) => reference,
            Err(e) => {
                counter!("fulfillment.refunds.failed", 1);
                if let Err(release_err) =
                    with_retry(&retry, move || self.release_refund(return_id)).await
                {
                    error!(
                        return_id = %return_id,
                        error = %release_err,
                        "Failed to release refund claim; return left refunding"
                    );
                }
                return Err(ServiceError::ExternalServiceError(format!(
                    "refund for return {} failed: {}",
                    return_id, e
                )));
            }
        };

        let refunded = {
            let reference = reference.as_str();
            with_retry(&retry, move || self.complete_refund(return_id, reference))
                .await
                .map_err(|e| {
                    error!(
                        return_id = %return_id,
                        refund_reference = %reference,
                        error = %e,
                        "Refund paid out but not recorded"
                    );
                    e
                })?
        };

        info!(
            return_id = %refunded.id,
            amount = %instruction.amount,
            refund_reference = %reference,
            "Return refunded"
        );
        counter!("fulfillment.refunds.completed", 1);
        self.event_sender
            .send_or_log(Event::ReturnRefunded {
                return_id: refunded.id,
                amount: instruction.amount,
                refund_reference: reference,
            })
            .await;
        Ok(refunded)
    }

    /// Moves an approved, unrefunded return to `refunding` and builds the
    /// payout instruction. Only one caller can win the claim.
    async fn claim_refund(&self, return_id: Uuid) -> Result<RefundInstruction, ServiceError> {
        let txn = self.db.begin().await?;
        let current = find_return(&txn, return_id, true).await?;
        if !current.awaiting_refund() {
            return Err(ServiceError::InvalidStage(format!(
                "return {} is {}, not awaiting a refund",
                current.id, current.status
            )));
        }
        let amount = current.refund_amount.ok_or_else(|| {
            ServiceError::InternalError(format!("return {} has no refund amount", current.id))
        })?;
        let order = find_order(&txn, current.order_id, false).await?;

        let claimed = current
            .apply(
                &txn,
                return_request::ActiveModel {
                    status: Set(RequestStatus::Refunding),
                    ..Default::default()
                },
            )
            .await?;
        txn.commit().await?;

        Ok(RefundInstruction {
            return_id: claimed.id,
            order_id: order.id,
            amount,
            payment_reference: match claimed.refund_method {
                RefundMethod::OriginalPayment => order.payment_reference,
                RefundMethod::Upi => None,
            },
            user_upi: claimed.user_upi,
        })
    }

    async fn complete_refund(
        &self,
        return_id: Uuid,
        reference: &str,
    ) -> Result<return_request::Model, ServiceError> {
        let txn = self.db.begin().await?;
        let current = find_return(&txn, return_id, true).await?;
        if current.status != RequestStatus::Refunding {
            return Err(ServiceError::InternalError(format!(
                "return {} is {}, expected a claimed refund",
                current.id, current.status
            )));
        }
        let refunded = current
            .apply(
                &txn,
                return_request::ActiveModel {
                    status: Set(RequestStatus::Refunded),
                    refund_reference: Set(Some(reference.to_string())),
                    refunded_at: Set(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        txn.commit().await?;
        Ok(refunded)
    }

    async fn release_refund(&self, return_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let current = find_return(&txn, return_id, true).await?;
        if current.status == RequestStatus::Refunding {
            current
                .apply(
                    &txn,
                    return_request::ActiveModel {
                        status: Set(RequestStatus::Approved),
                        ..Default::default()
                    },
                )
                .await?;
        }
        txn.commit().await?;
        Ok(())
    }
}

async fn find_return<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    for_update: bool,
) -> Result<return_request::Model, ServiceError> {
    let mut query = ReturnRequest::find_by_id(id);
    if for_update {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", id)))
}

async fn find_replacement<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
    for_update: bool,
) -> Result<replacement_request::Model, ServiceError> {
    let mut query = ReplacementRequest::find_by_id(id);
    if for_update {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Replacement {} not found", id)))
}

fn required_text(value: &str, message: &str) -> Result<String, ServiceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::ValidationError(message.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Creation-time eligibility: the policy flag snapshotted on the item, the
/// item delivered, and the window since delivery still open.
pub fn check_eligibility(
    item: &order_item::Model,
    kind: RemediationKind,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let (allowed, days) = match kind {
        RemediationKind::Return => (item.allow_return, item.return_days),
        RemediationKind::Replacement => (item.allow_replacement, item.replacement_days),
    };
    if !allowed {
        return Err(ServiceError::NotEligible(format!(
            "item {} does not allow a {}",
            item.id, kind
        )));
    }
    let delivered_at = match (item.status, item.delivered_at) {
        (FulfillmentStatus::Delivered, Some(at)) => at,
        _ => {
            return Err(ServiceError::NotEligible(format!(
                "item {} has not been delivered",
                item.id
            )))
        }
    };
    if now > delivered_at + Duration::days(i64::from(days.max(0))) {
        return Err(ServiceError::NotEligible(format!(
            "the {} window of {} days for item {} has closed",
            kind, days, item.id
        )));
    }
    Ok(())
}

pub fn check_pickup(stages: Stages, outcome: PickupStatus) -> Result<(), ServiceError> {
    if outcome == PickupStatus::Pending {
        return Err(ServiceError::ValidationError(
            "pickup outcome must be collected or failed".to_string(),
        ));
    }
    if stages.status == RequestStatus::Rejected || stages.warehouse != Decision::Pending {
        return Err(ServiceError::InvalidStage(
            "pickup can no longer change once the warehouse has decided".to_string(),
        ));
    }
    if stages.pickup == PickupStatus::Collected {
        return Err(ServiceError::InvalidStage(
            "pickup is already recorded as collected".to_string(),
        ));
    }
    Ok(())
}

pub fn check_warehouse(stages: Stages, decision: Decision) -> Result<(), ServiceError> {
    if decision == Decision::Pending {
        return Err(ServiceError::ValidationError(
            "decision must be approved or rejected".to_string(),
        ));
    }
    if stages.pickup == PickupStatus::Pending {
        return Err(ServiceError::InvalidStage(
            "the pickup has not been recorded yet".to_string(),
        ));
    }
    if stages.warehouse != Decision::Pending {
        return Err(ServiceError::InvalidStage(format!(
            "the warehouse already {} this request",
            stages.warehouse
        )));
    }
    if decision == Decision::Approved && stages.pickup != PickupStatus::Collected {
        return Err(ServiceError::InvalidStage(
            "approval requires the item to have been collected".to_string(),
        ));
    }
    Ok(())
}

pub fn check_admin(stages: Stages, decision: Decision) -> Result<(), ServiceError> {
    if decision == Decision::Pending {
        return Err(ServiceError::ValidationError(
            "decision must be approved or rejected".to_string(),
        ));
    }
    match stages.warehouse {
        Decision::Pending => Err(ServiceError::InvalidStage(
            "the warehouse has not decided yet".to_string(),
        )),
        Decision::Rejected => Err(ServiceError::InvalidStage(
            "the warehouse rejected this request".to_string(),
        )),
        Decision::Approved if stages.admin != Decision::Pending => Err(ServiceError::InvalidStage(
            format!("an admin already {} this request", stages.admin),
        )),
        Decision::Approved => Ok(()),
    }
}

/// Refunds must be positive and cannot exceed what was paid for the line.
pub fn check_refund_amount(amount: Option<Decimal>, line_total: Decimal) -> Result<Decimal, ServiceError> {
    let amount = amount.ok_or_else(|| {
        ServiceError::ValidationError("a refund amount is required to approve a return".to_string())
    })?;
    if amount <= Decimal::ZERO || amount > line_total {
        return Err(ServiceError::ValidationError(format!(
            "refund amount {} must be greater than 0 and at most {}",
            amount, line_total
        )));
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn stages(pickup: PickupStatus, warehouse: Decision, admin: Decision) -> Stages {
        let status = if warehouse == Decision::Rejected || admin == Decision::Rejected {
            RequestStatus::Rejected
        } else if pickup == PickupStatus::Pending {
            RequestStatus::Pending
        } else {
            RequestStatus::InProgress
        };
        Stages {
            status,
            pickup,
            warehouse,
            admin,
        }
    }

    fn delivered_item(delivered_at: DateTime<Utc>) -> order_item::Model {
        let now = Utc::now();
        order_item::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            variant_id: Uuid::new_v4(),
            product_name: "Canvas Tote".to_string(),
            sku: "TOTE-001".to_string(),
            unit_price: dec!(250),
            quantity: 1,
            line_total: dec!(250),
            status: FulfillmentStatus::Delivered,
            picked_at: Some(now),
            packed_at: Some(now),
            shipped_at: Some(now),
            out_for_delivery_at: Some(now),
            delivered_at: Some(delivered_at),
            failed_at: None,
            failure_reason: None,
            otp_hash: None,
            otp_status: order_item::OtpStatus::Verified,
            otp_expires_at: None,
            otp_attempts: 0,
            allow_return: true,
            return_days: 7,
            allow_replacement: false,
            replacement_days: 0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn return_window_is_measured_from_delivery() {
        let now = Utc::now();
        let fresh = delivered_item(now - Duration::days(2));
        assert!(check_eligibility(&fresh, RemediationKind::Return, now).is_ok());

        let stale = delivered_item(now - Duration::days(10));
        assert_matches!(
            check_eligibility(&stale, RemediationKind::Return, now),
            Err(ServiceError::NotEligible(_))
        );
    }

    #[test]
    fn policy_flag_and_delivery_are_required() {
        let now = Utc::now();
        let item = delivered_item(now);
        assert_matches!(
            check_eligibility(&item, RemediationKind::Replacement, now),
            Err(ServiceError::NotEligible(_))
        );

        let mut in_transit = delivered_item(now);
        in_transit.status = FulfillmentStatus::OutForDelivery;
        in_transit.delivered_at = None;
        assert_matches!(
            check_eligibility(&in_transit, RemediationKind::Return, now),
            Err(ServiceError::NotEligible(_))
        );
    }

    #[rstest]
    #[case(PickupStatus::Pending, Decision::Pending, PickupStatus::Collected, true)]
    #[case(PickupStatus::Pending, Decision::Pending, PickupStatus::Failed, true)]
    #[case(PickupStatus::Failed, Decision::Pending, PickupStatus::Collected, true)]
    #[case(PickupStatus::Collected, Decision::Pending, PickupStatus::Failed, false)]
    #[case(PickupStatus::Failed, Decision::Rejected, PickupStatus::Collected, false)]
    fn pickup_guard(
        #[case] pickup: PickupStatus,
        #[case] warehouse: Decision,
        #[case] outcome: PickupStatus,
        #[case] allowed: bool,
    ) {
        let result = check_pickup(stages(pickup, warehouse, Decision::Pending), outcome);
        assert_eq!(result.is_ok(), allowed, "{:?}", result);
    }

    #[rstest]
    #[case(PickupStatus::Pending, Decision::Approved, false)]
    #[case(PickupStatus::Pending, Decision::Rejected, false)]
    #[case(PickupStatus::Collected, Decision::Approved, true)]
    #[case(PickupStatus::Failed, Decision::Rejected, true)]
    #[case(PickupStatus::Failed, Decision::Approved, false)]
    fn warehouse_guard(
        #[case] pickup: PickupStatus,
        #[case] decision: Decision,
        #[case] allowed: bool,
    ) {
        let result = check_warehouse(stages(pickup, Decision::Pending, Decision::Pending), decision);
        assert_eq!(result.is_ok(), allowed, "{:?}", result);
        if !allowed {
            assert_matches!(result, Err(ServiceError::InvalidStage(_)));
        }
    }

    #[test]
    fn warehouse_decides_only_once() {
        let decided = stages(PickupStatus::Collected, Decision::Approved, Decision::Pending);
        assert_matches!(
            check_warehouse(decided, Decision::Rejected),
            Err(ServiceError::InvalidStage(_))
        );
    }

    #[rstest]
    #[case(Decision::Pending, Decision::Pending, false)]
    #[case(Decision::Rejected, Decision::Pending, false)]
    #[case(Decision::Approved, Decision::Pending, true)]
    #[case(Decision::Approved, Decision::Approved, false)]
    fn admin_guard(#[case] warehouse: Decision, #[case] admin: Decision, #[case] allowed: bool) {
        let result = check_admin(stages(PickupStatus::Collected, warehouse, admin), Decision::Approved);
        assert_eq!(result.is_ok(), allowed, "{:?}", result);
        if !allowed {
            assert_matches!(result, Err(ServiceError::InvalidStage(_)));
        }
    }

    #[test]
    fn pending_is_not_a_decision() {
        let ready = stages(PickupStatus::Collected, Decision::Approved, Decision::Pending);
        assert_matches!(
            check_admin(ready, Decision::Pending),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            check_pickup(ready, PickupStatus::Pending),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[rstest]
    #[case(Some(dec!(250)), true)]
    #[case(Some(dec!(0.01)), true)]
    #[case(Some(dec!(250.01)), false)]
    #[case(Some(dec!(0)), false)]
    #[case(Some(dec!(-5)), false)]
    #[case(None, false)]
    fn refund_amount_bounds(#[case] amount: Option<Decimal>, #[case] allowed: bool) {
        assert_eq!(check_refund_amount(amount, dec!(250)).is_ok(), allowed);
    }

    #[test]
    fn rejections_end_the_request() {
        let change = StageChange::Warehouse {
            decision: Decision::Rejected,
            comment: "seal broken".to_string(),
        };
        assert_eq!(change.resulting_status(), RequestStatus::Rejected);

        let change = StageChange::Admin {
            decision: Decision::Approved,
            comment: "ok".to_string(),
            refund_amount: Some(dec!(10)),
        };
        assert_eq!(change.resulting_status(), RequestStatus::Approved);

        let change = StageChange::Pickup {
            outcome: PickupStatus::Failed,
            comment: None,
        };
        assert_eq!(change.resulting_status(), RequestStatus::InProgress);
    }

    #[test]
    fn requests_serialize_with_their_kind() {
        let json = serde_json::to_value(RemediationKind::Replacement).unwrap();
        assert_eq!(json, serde_json::json!("replacement"));
    }
}
