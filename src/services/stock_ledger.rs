//! Stock Ledger: authoritative per-variant available quantity.
//!
//! All writes are conditional single-statement updates executed on the
//! caller's connection, so they join whatever transaction the caller holds
//! and roll back with it.

use crate::entities::product_variant::{self, Entity as ProductVariant};
use crate::errors::ServiceError;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, warn};
use uuid::Uuid;

/// Takes `quantity` units of `variant_id` out of stock.
///
/// Returns the variant as read before the decrement so the caller can snapshot
/// its price and display attributes. Fails with `InsufficientStock` when the
/// variant is inactive or holds fewer than `quantity` units; nothing is
/// written in that case.
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
) -> Result<product_variant::Model, ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ValidationError(format!(
            "quantity for variant {} must be at least 1",
            variant_id
        )));
    }

    let variant = ProductVariant::find_by_id(variant_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Variant {} not found", variant_id)))?;

    if !variant.is_active {
        return Err(ServiceError::InsufficientStock(format!(
            "{} ({}) is no longer available",
            variant.name, variant.sku
        )));
    }

    let result = ProductVariant::update_many()
        .col_expr(
            product_variant::Column::Stock,
            Expr::col(product_variant::Column::Stock).sub(quantity),
        )
        .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product_variant::Column::Id.eq(variant_id))
        .filter(product_variant::Column::IsActive.eq(true))
        .filter(product_variant::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        warn!(
            variant_id = %variant_id,
            requested = quantity,
            "Stock reservation rejected"
        );
        return Err(ServiceError::InsufficientStock(format!(
            "{} ({}): requested {}, available {}",
            variant.name, variant.sku, quantity, variant.stock
        )));
    }

    debug!(variant_id = %variant_id, quantity, "Stock reserved");
    Ok(variant)
}

/// Returns `quantity` units of `variant_id` to stock.
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
) -> Result<(), ServiceError> {
    let result = ProductVariant::update_many()
        .col_expr(
            product_variant::Column::Stock,
            Expr::col(product_variant::Column::Stock).add(quantity),
        )
        .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(product_variant::Column::Id.eq(variant_id))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        warn!(variant_id = %variant_id, quantity, "Released stock for unknown variant");
    } else {
        debug!(variant_id = %variant_id, quantity, "Stock released");
    }
    Ok(())
}
