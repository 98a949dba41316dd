// Collaborators
pub mod payments;
pub mod pricing;
pub mod stock_ledger;

// Workflow core
pub mod cart_reconciler;
pub mod delivery_confirmation;
pub mod fulfillment;
pub mod order_intake;
pub mod remediation;

use crate::entities::{
    order::{self, Entity as Order},
    order_item::{self, Entity as OrderItem},
};
use crate::errors::ServiceError;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An order together with all of its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Loads an order by its human-facing number.
pub(crate) async fn find_order_by_number<C: ConnectionTrait>(
    conn: &C,
    order_number: &str,
    for_update: bool,
) -> Result<order::Model, ServiceError> {
    let mut query = Order::find_by_number(order_number);
    if for_update {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
}

pub(crate) async fn find_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    for_update: bool,
) -> Result<order::Model, ServiceError> {
    let mut query = Order::find_by_id(order_id);
    if for_update {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub(crate) async fn find_item<C: ConnectionTrait>(
    conn: &C,
    item_id: Uuid,
    for_update: bool,
) -> Result<order_item::Model, ServiceError> {
    let mut query = OrderItem::find_by_id(item_id);
    if for_update {
        query = query.lock_exclusive();
    }
    query
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order item {} not found", item_id)))
}

pub(crate) async fn items_of<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    for_update: bool,
) -> Result<Vec<order_item::Model>, ServiceError> {
    let mut query = OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .order_by_asc(order_item::Column::Id);
    if for_update {
        query = query.lock_exclusive();
    }
    Ok(query.all(conn).await?)
}
