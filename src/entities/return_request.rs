use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Customer return against a delivered order item.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "return_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_item_id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub status: RequestStatus,
    pub pickup_status: PickupStatus,
    pub pickup_comment: Option<String>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub warehouse_status: Decision,
    pub warehouse_comment: Option<String>,
    pub warehouse_decided_at: Option<DateTime<Utc>>,
    pub admin_status: Decision,
    pub admin_comment: Option<String>,
    pub admin_decided_at: Option<DateTime<Utc>>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub refund_amount: Option<Decimal>,
    pub refund_method: RefundMethod,
    pub user_upi: Option<String>,
    pub refund_reference: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order_item::Entity",
        from = "Column::OrderItemId",
        to = "super::order_item::Column::Id"
    )]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Writes `changes` if the row still carries this model's version, then
    /// returns the refreshed row.
    pub async fn apply<C: ConnectionTrait>(
        &self,
        conn: &C,
        mut changes: ActiveModel,
    ) -> Result<Model, ServiceError> {
        changes.version = Set(self.version + 1);
        changes.updated_at = Set(Utc::now());

        let result = Entity::update_many()
            .set(changes)
            .filter(Column::Id.eq(self.id))
            .filter(Column::Version.eq(self.version))
            .exec(conn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(self.id));
        }

        Entity::find_by_id(self.id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {} not found", self.id)))
    }

    /// Admin approved but the refund collaborator has not confirmed yet.
    pub fn awaiting_refund(&self) -> bool {
        self.status == RequestStatus::Approved && self.refunded_at.is_none()
    }
}

/// Overall status shared by returns and replacements.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "approved")]
    Approved,
    /// Returns only: payout claimed and handed to the refund collaborator
    #[sea_orm(string_value = "refunding")]
    Refunding,
    /// Returns only: refund confirmed by the collaborator
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "rejected")]
    Rejected,
}

impl RequestStatus {
    /// Every request blocks a second one of the same kind unless it was rejected.
    pub fn is_active(self) -> bool {
        self != Self::Rejected
    }
}

/// Delivery-agent stage outcome.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PickupStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "collected")]
    Collected,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// Warehouse or admin sign-off.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "rejected")]
    Rejected,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RefundMethod {
    /// Back through the gateway that took the online payment
    #[sea_orm(string_value = "original_payment")]
    OriginalPayment,
    /// Cash-on-delivery orders are refunded to the customer's UPI handle
    #[sea_orm(string_value = "upi")]
    Upi,
}
