use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Record of a completed guest-cart reconciliation, keyed by snapshot fingerprint.
///
/// `outcome` holds the serialized `ReconcileOutcome` returned to the caller so a
/// replayed snapshot gets the same answer without touching the cart again.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "guest_cart_merges")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: Uuid,
    pub fingerprint: String,
    #[sea_orm(column_type = "Json")]
    pub outcome: Json,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
