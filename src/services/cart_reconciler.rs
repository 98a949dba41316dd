//! Cart Reconciler: merges a guest's locally held cart into the user's server
//! cart at login.
//!
//! Merges for one user are serialized behind a per-user async mutex that is
//! dropped from the lock table once no merge holds it. Every completed merge
//! is recorded under a fingerprint of its snapshot; the same snapshot
//! submitted again inside the replay window gets the recorded answer back and
//! the cart is left alone. Checking out the cart discards those records.

use crate::auth::{Actor, ActorRole};
use crate::entities::{
    cart::{self, Entity as Cart},
    cart_item::{self, Entity as CartItem},
    guest_cart_merge::{self, Entity as GuestCartMerge},
    product_variant::{self, Entity as ProductVariant},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::retry::{with_retry, RetryConfig};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// One `(variant, quantity)` pair from client-local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCartEntry {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub items: Vec<GuestCartEntry>,
    /// Client-generated id for this snapshot; when absent the snapshot
    /// contents are hashed instead.
    #[serde(default)]
    pub merge_token: Option<String>,
}

/// A guest entry that now lives in the server cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciledLine {
    pub variant_id: Uuid,
    pub requested: i32,
    pub quantity_in_cart: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeFailureReason {
    InvalidQuantity,
    Unavailable,
    OutOfStock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLine {
    pub variant_id: Uuid,
    pub requested: i32,
    pub reason: MergeFailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub merged: Vec<ReconciledLine>,
    pub skipped: Vec<ReconciledLine>,
    pub failed: Vec<FailedLine>,
    /// True when this answer was replayed from an earlier identical merge.
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLine {
    pub item_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub sku: Option<String>,
    pub name: Option<String>,
    pub unit_price: Option<Decimal>,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartView {
    pub user_id: Uuid,
    pub cart_id: Option<Uuid>,
    pub items: Vec<CartLine>,
}

const MAX_REPLAY_WINDOW_SECS: u64 = 366 * 86_400;

#[derive(Clone)]
pub struct CartReconcilerService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    user_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    replay_window: Duration,
}

impl CartReconcilerService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender, replay_window_secs: u64) -> Self {
        Self {
            db,
            event_sender,
            user_locks: Arc::new(DashMap::new()),
            replay_window: Duration::seconds(replay_window_secs.min(MAX_REPLAY_WINDOW_SECS) as i64),
        }
    }

    /// Merges a guest snapshot into the caller's server cart.
    #[instrument(skip(self, request), fields(actor_id = %actor.id, entries = request.items.len()))]
    pub async fn reconcile(
        &self,
        actor: Actor,
        request: ReconcileRequest,
    ) -> Result<ReconcileOutcome, ServiceError> {
        actor.require_role(&[ActorRole::Customer], "merge a guest cart")?;
        let user_id = actor.id;
        let entries = fold_entries(&request.items);
        let fingerprint = fingerprint(request.merge_token.as_deref(), &entries);

        let lock = self
            .user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            let entries = &entries;
            let fingerprint = fingerprint.as_str();
            with_retry(&RetryConfig::default(), move || {
                self.merge_snapshot(user_id, entries, fingerprint)
            })
            .await
        };
        drop(lock);
        // Entries are cloned and removed under the same shard lock, so a
        // count of one means no merge for this user holds or awaits it.
        self.user_locks
            .remove_if(&user_id, |_, held| Arc::strong_count(held) == 1);
        let outcome = result?;

        if outcome.replayed {
            debug!(user_id = %user_id, "Guest cart snapshot replayed");
            counter!("fulfillment.cart.merge_replayed", 1);
        } else {
            info!(
                user_id = %user_id,
                merged = outcome.merged.len(),
                skipped = outcome.skipped.len(),
                failed = outcome.failed.len(),
                "Guest cart reconciled"
            );
            counter!("fulfillment.cart.merged", 1);
        }
        self.emit(user_id, &outcome).await;
        Ok(outcome)
    }

    async fn merge_snapshot(
        &self,
        user_id: Uuid,
        entries: &[GuestCartEntry],
        fingerprint: &str,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        if let Some(previous) = self.recent_merge(&txn, user_id, fingerprint).await? {
            let mut outcome: ReconcileOutcome = serde_json::from_value(previous.outcome)
                .map_err(|e| ServiceError::InternalError(format!("stored merge outcome: {}", e)))?;
            outcome.replayed = true;
            txn.commit().await?;
            return Ok(outcome);
        }

        let cart = find_or_create_cart(&txn, user_id).await?;
        let mut outcome = ReconcileOutcome::default();

        for entry in entries.iter().copied() {
            if entry.quantity <= 0 {
                outcome.failed.push(FailedLine {
                    variant_id: entry.variant_id,
                    requested: entry.quantity,
                    reason: MergeFailureReason::InvalidQuantity,
                });
                continue;
            }

            let variant = ProductVariant::find_by_id(entry.variant_id).one(&txn).await?;
            let stock = match variant {
                Some(ref v) if !v.is_active => None,
                Some(ref v) => Some(v.stock),
                None => None,
            };
            let Some(stock) = stock else {
                outcome.failed.push(FailedLine {
                    variant_id: entry.variant_id,
                    requested: entry.quantity,
                    reason: MergeFailureReason::Unavailable,
                });
                continue;
            };
            if stock <= 0 {
                outcome.failed.push(FailedLine {
                    variant_id: entry.variant_id,
                    requested: entry.quantity,
                    reason: MergeFailureReason::OutOfStock,
                });
                continue;
            }

            let existing = CartItem::find()
                .filter(cart_item::Column::CartId.eq(cart.id))
                .filter(cart_item::Column::VariantId.eq(entry.variant_id))
                .one(&txn)
                .await?;

            match existing {
                Some(line) => {
                    let target = line.quantity.saturating_add(entry.quantity).min(stock);
                    let carried_over = target > line.quantity;
                    if target != line.quantity {
                        let mut active: cart_item::ActiveModel = line.clone().into();
                        active.quantity = Set(target);
                        active.updated_at = Set(Utc::now());
                        active.update(&txn).await?;
                    }
                    let reconciled = ReconciledLine {
                        variant_id: entry.variant_id,
                        requested: entry.quantity,
                        quantity_in_cart: target,
                    };
                    if carried_over {
                        outcome.merged.push(reconciled);
                    } else {
                        outcome.skipped.push(reconciled);
                    }
                }
                None => {
                    let quantity = entry.quantity.min(stock);
                    let now = Utc::now();
                    cart_item::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        cart_id: Set(cart.id),
                        variant_id: Set(entry.variant_id),
                        quantity: Set(quantity),
                        created_at: Set(now),
                        updated_at: Set(now),
                    }
                    .insert(&txn)
                    .await?;
                    outcome.merged.push(ReconciledLine {
                        variant_id: entry.variant_id,
                        requested: entry.quantity,
                        quantity_in_cart: quantity,
                    });
                }
            }
        }

        let stored = serde_json::to_value(&outcome)
            .map_err(|e| ServiceError::InternalError(format!("merge outcome: {}", e)))?;
        guest_cart_merge::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            fingerprint: Set(fingerprint.to_string()),
            outcome: Set(stored),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(outcome)
    }

    /// The caller's server cart with current variant details.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn get_cart(&self, actor: Actor) -> Result<CartView, ServiceError> {
        actor.require_role(&[ActorRole::Customer], "view a cart")?;
        let db = &*self.db;

        let Some(cart) = Cart::find()
            .filter(cart::Column::UserId.eq(actor.id))
            .one(db)
            .await?
        else {
            return Ok(CartView {
                user_id: actor.id,
                cart_id: None,
                items: Vec::new(),
            });
        };

        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .find_also_related(ProductVariant)
            .all(db)
            .await?
            .into_iter()
            .map(|(line, variant)| CartLine {
                item_id: line.id,
                variant_id: line.variant_id,
                quantity: line.quantity,
                sku: variant.as_ref().map(|v| v.sku.clone()),
                name: variant.as_ref().map(|v| v.name.clone()),
                unit_price: variant.as_ref().map(|v| v.price),
                available: variant
                    .as_ref()
                    .map(product_variant::Model::is_purchasable)
                    .unwrap_or(false),
            })
            .collect();

        Ok(CartView {
            user_id: actor.id,
            cart_id: Some(cart.id),
            items,
        })
    }

    async fn recent_merge<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<guest_cart_merge::Model>, ServiceError> {
        let latest = GuestCartMerge::find()
            .filter(guest_cart_merge::Column::UserId.eq(user_id))
            .filter(guest_cart_merge::Column::Fingerprint.eq(fingerprint))
            .order_by_desc(guest_cart_merge::Column::CreatedAt)
            .one(conn)
            .await?;
        let cutoff = Utc::now() - self.replay_window;
        Ok(latest.filter(|merge| merge.created_at > cutoff))
    }

    async fn emit(&self, user_id: Uuid, outcome: &ReconcileOutcome) {
        self.event_sender
            .send_or_log(Event::GuestCartReconciled {
                user_id,
                merged: outcome.merged.len(),
                skipped: outcome.skipped.len(),
                failed: outcome.failed.len(),
                replayed: outcome.replayed,
            })
            .await;
    }
}

async fn find_or_create_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<cart::Model, ServiceError> {
    if let Some(cart) = Cart::find()
        .filter(cart::Column::UserId.eq(user_id))
        .one(conn)
        .await?
    {
        return Ok(cart);
    }

    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    Ok(cart)
}

/// Sums duplicate entries, keeping first-seen order.
fn fold_entries(entries: &[GuestCartEntry]) -> Vec<GuestCartEntry> {
    let mut folded: Vec<GuestCartEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(idx) = folded.iter().position(|e| e.variant_id == entry.variant_id) {
            folded[idx].quantity = folded[idx].quantity.saturating_add(entry.quantity);
        } else {
            folded.push(*entry);
        }
    }
    folded
}

/// Stable identity of a guest snapshot: the client token if given, otherwise
/// a SHA-256 over the folded entries sorted by variant.
fn fingerprint(merge_token: Option<&str>, entries: &[GuestCartEntry]) -> String {
    if let Some(token) = merge_token.map(str::trim).filter(|t| !t.is_empty()) {
        return format!("token:{}", token);
    }

    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|e| e.variant_id);
    let mut hasher = Sha256::new();
    for entry in &sorted {
        hasher.update(format!("{}:{};", entry.variant_id, entry.quantity).as_bytes());
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use tokio::sync::mpsc;

    fn entry(variant_id: Uuid, quantity: i32) -> GuestCartEntry {
        GuestCartEntry {
            variant_id,
            quantity,
        }
    }

    #[test]
    fn fold_sums_duplicates_in_first_seen_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let folded = fold_entries(&[entry(a, 1), entry(b, 2), entry(a, 4)]);
        assert_eq!(folded, vec![entry(a, 5), entry(b, 2)]);
    }

    #[test]
    fn fingerprint_ignores_entry_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            fingerprint(None, &[entry(a, 1), entry(b, 2)]),
            fingerprint(None, &[entry(b, 2), entry(a, 1)])
        );
        assert_ne!(
            fingerprint(None, &[entry(a, 1)]),
            fingerprint(None, &[entry(a, 2)])
        );
    }

    #[test]
    fn merge_token_takes_precedence() {
        let a = Uuid::new_v4();
        assert_eq!(fingerprint(Some(" tab-1 "), &[entry(a, 1)]), "token:tab-1");
        assert!(fingerprint(Some("  "), &[entry(a, 1)]).starts_with("sha256:"));
    }

    #[tokio::test]
    async fn idle_user_locks_are_evicted() {
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        };
        let pool = establish_connection_with_config(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let (tx, _rx) = mpsc::channel(64);
        let service = CartReconcilerService::new(Arc::new(pool), EventSender::new(tx), 86_400);

        let shared = Actor::customer(Uuid::new_v4());
        let snapshot = ReconcileRequest {
            items: Vec::new(),
            merge_token: Some("tab".to_string()),
        };
        let (first, second) = tokio::join!(
            service.reconcile(shared, snapshot.clone()),
            service.reconcile(shared, snapshot.clone()),
        );
        first.unwrap();
        second.unwrap();
        for _ in 0..3 {
            service
                .reconcile(Actor::customer(Uuid::new_v4()), snapshot.clone())
                .await
                .unwrap();
        }

        assert!(service.user_locks.is_empty());
    }
}
