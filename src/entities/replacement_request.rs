use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

pub use super::return_request::{Decision, PickupStatus, RequestStatus};

/// Customer request to swap a delivered item for a new unit.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "replacement_requests")]
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
            .ok_or_else(|| ServiceError::NotFound(format!("Replacement {} not found", self.id)))
    }
}
