use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use strum::Display;

/// One purchased line of an order, carrying its own fulfillment lifecycle.
///
/// Name, SKU, price and remediation policy are copied from the variant at
/// checkout; later catalog edits never reach this row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub variant_id: Uuid,
    pub product_name: String,
    pub sku: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub unit_price: Decimal,
    pub quantity: i32,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub line_total: Decimal,
    pub status: FulfillmentStatus,
    pub picked_at: Option<DateTime<Utc>>,
    pub packed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub out_for_delivery_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    #[serde(skip_serializing)]
    pub otp_hash: Option<String>,
    pub otp_status: OtpStatus,
    pub otp_expires_at: Option<DateTime<Utc>>,
    pub otp_attempts: i32,
    pub allow_return: bool,
    pub return_days: i32,
    pub allow_replacement: bool,
    pub replacement_days: i32,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
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
            .ok_or_else(|| ServiceError::NotFound(format!("Order item {} not found", self.id)))
    }
}

/// Per-item fulfillment state.
///
/// ```text
/// pending -> picked -> packed -> shipped -> out_for_delivery -> delivered
///                                               ^      |
///                                               |      v
///                                               +--- failed
/// ```
/// `cancelled` is reachable only through order cancellation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FulfillmentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "picked")]
    Picked,
    #[sea_orm(string_value = "packed")]
    Packed,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "out_for_delivery")]
    OutForDelivery,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl FulfillmentStatus {
    /// Progress rank used for order aggregation. A failed attempt ranks below
    /// an item still out for delivery so the order surfaces the failure.
    pub fn progress_rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Picked => 1,
            Self::Packed => 2,
            Self::Shipped => 3,
            Self::Failed => 4,
            Self::OutForDelivery => 5,
            Self::Delivered => 6,
            Self::Cancelled => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }
}

/// Delivery OTP handshake state for an item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OtpStatus {
    #[sea_orm(string_value = "not_sent")]
    NotSent,
    #[sea_orm(string_value = "sent")]
    Sent,
    #[sea_orm(string_value = "verified")]
    Verified,
}
