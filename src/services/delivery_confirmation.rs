//! Delivery Confirmation Gate.
//!
//! The only path to `delivered`: the assigned agent issues a one-time code
//! to the customer and completes the handover by submitting it back. Codes
//! are stored as keyed hashes with an expiry; a successful verification and
//! the `delivered` transition commit together.

use crate::auth::{Actor, ActorRole};
use crate::config::AppConfig;
use crate::entities::{
    order::{self, OrderStatus, PaymentMethod},
    order_item::{self, FulfillmentStatus, OtpStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::retry::{with_retry, RetryConfig};
use crate::services::fulfillment::{lock_order_and_item, refresh_order_status, require_assigned_agent};
use crate::services::payments::mark_paid;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use rand::Rng;
use sea_orm::{DatabaseConnection, Set, TransactionTrait};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_OTP_TTL_SECS: u64 = 7 * 86_400;

/// Produces the plaintext code handed to the customer.
pub trait OtpGenerator: Send + Sync {
    fn generate(&self, length: u32) -> String;
}

/// Uniformly random decimal digits.
#[derive(Debug, Default, Clone)]
pub struct RandomOtpGenerator;

impl OtpGenerator for RandomOtpGenerator {
    fn generate(&self, length: u32) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect()
    }
}

/// Always returns the same code. Used by tests and local demos.
#[derive(Debug, Clone)]
pub struct FixedOtpGenerator(pub String);

impl OtpGenerator for FixedOtpGenerator {
    fn generate(&self, _length: u32) -> String {
        self.0.clone()
    }
}

/// Delivers a freshly issued code to the customer (SMS, e-mail, push).
#[async_trait]
pub trait OtpNotifier: Send + Sync {
    async fn deliver(
        &self,
        order: &order::Model,
        item: &order_item::Model,
        code: &str,
    ) -> Result<(), ServiceError>;
}

/// Notifier that only records that a code went out.
#[derive(Debug, Default, Clone)]
pub struct LoggingOtpNotifier;

#[async_trait]
impl OtpNotifier for LoggingOtpNotifier {
    async fn deliver(
        &self,
        order: &order::Model,
        item: &order_item::Model,
        _code: &str,
    ) -> Result<(), ServiceError> {
        info!(
            order_number = %order.order_number,
            user_id = %order.user_id,
            item_id = %item.id,
            "Delivery OTP dispatched"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OtpSettings {
    pub length: u32,
    pub ttl: Duration,
    pub max_attempts: i32,
    pub secret: String,
}

impl OtpSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            length: config.otp_length,
            ttl: Duration::seconds(config.otp_ttl_secs.min(MAX_OTP_TTL_SECS) as i64),
            max_attempts: i32::try_from(config.otp_max_attempts).unwrap_or(i32::MAX),
            secret: config.otp_secret.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DeliveryConfirmationService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    settings: OtpSettings,
    generator: Arc<dyn OtpGenerator>,
    notifier: Arc<dyn OtpNotifier>,
}

impl DeliveryConfirmationService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        settings: OtpSettings,
        generator: Arc<dyn OtpGenerator>,
        notifier: Arc<dyn OtpNotifier>,
    ) -> Self {
        Self {
            db,
            event_sender,
            settings,
            generator,
            notifier,
        }
    }

    /// Issues the first code for an item that is out for delivery.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn send_otp(&self, actor: Actor, item_id: Uuid) -> Result<order_item::Model, ServiceError> {
        with_retry(&RetryConfig::default(), move || self.issue(actor, item_id, false)).await
    }

    /// Replaces the active code with a fresh one, restarting its expiry and
    /// attempt counter. The handshake state stays `sent`.
    #[instrument(skip(self), fields(actor_id = %actor.id))]
    pub async fn resend_otp(&self, actor: Actor, item_id: Uuid) -> Result<order_item::Model, ServiceError> {
        with_retry(&RetryConfig::default(), move || self.issue(actor, item_id, true)).await
    }

    async fn issue(
        &self,
        actor: Actor,
        item_id: Uuid,
        resend: bool,
    ) -> Result<order_item::Model, ServiceError> {
        actor.require_role(&[ActorRole::DeliveryAgent], "issue delivery codes")?;

        let txn = self.db.begin().await?;
        let (order, item) = lock_order_and_item(&txn, item_id).await?;
        require_assigned_agent(&actor, &order)?;

        if item.status != FulfillmentStatus::OutForDelivery {
            return Err(ServiceError::InvalidTransition(format!(
                "item {} is {}, codes are only issued while out for delivery",
                item.id, item.status
            )));
        }
        let expected = if resend { OtpStatus::Sent } else { OtpStatus::NotSent };
        if item.otp_status != expected {
            let hint = if resend {
                "no code has been sent yet"
            } else {
                "a code was already sent, resend it instead"
            };
            return Err(ServiceError::InvalidTransition(format!(
                "item {} has otp status {}: {}",
                item.id, item.otp_status, hint
            )));
        }

        let code = self.generator.generate(self.settings.length);
        let hash = hash_otp(&self.settings.secret, item.id, &code)?;
        let updated = item
            .apply(
                &txn,
                order_item::ActiveModel {
                    otp_hash: Set(Some(hash)),
                    otp_status: Set(OtpStatus::Sent),
                    otp_expires_at: Set(Some(Utc::now() + self.settings.ttl)),
                    otp_attempts: Set(0),
                    ..Default::default()
                },
            )
            .await?;

        txn.commit().await?;

        if let Err(e) = self.notifier.deliver(&order, &updated, &code).await {
            error!(error = %e, item_id = %updated.id, "Failed to deliver OTP to customer");
            return Err(ServiceError::ExternalServiceError(format!(
                "code for item {} could not be delivered, resend it",
                updated.id
            )));
        }

        info!(order_id = %order.id, item_id = %updated.id, resend, "Delivery OTP issued");
        counter!("fulfillment.otp.issued", 1, "resend" => resend.to_string());
        self.event_sender
            .send_or_log(Event::OtpIssued {
                item_id: updated.id,
                resend,
            })
            .await;
        Ok(updated)
    }

    /// Checks the customer's code. On a match the item is delivered in the
    /// same transaction; a cash-on-delivery order whose last item this was is
    /// marked paid.
    #[instrument(skip(self, code), fields(actor_id = %actor.id))]
    pub async fn verify_otp(
        &self,
        actor: Actor,
        item_id: Uuid,
        code: &str,
    ) -> Result<order_item::Model, ServiceError> {
        with_retry(&RetryConfig::default(), move || {
            self.verify_otp_inner(actor, item_id, code)
        })
        .await
    }

    async fn verify_otp_inner(
        &self,
        actor: Actor,
        item_id: Uuid,
        code: &str,
    ) -> Result<order_item::Model, ServiceError> {
        actor.require_role(&[ActorRole::DeliveryAgent], "confirm deliveries")?;
        let code = code.trim();
        if code.is_empty() {
            return Err(ServiceError::ValidationError("a code is required".to_string()));
        }

        let txn = self.db.begin().await?;
        let (order, item) = lock_order_and_item(&txn, item_id).await?;
        require_assigned_agent(&actor, &order)?;

        if item.status != FulfillmentStatus::OutForDelivery || item.otp_status != OtpStatus::Sent {
            return Err(ServiceError::InvalidTransition(format!(
                "item {} is {} with otp status {}, nothing to verify",
                item.id, item.status, item.otp_status
            )));
        }
        if item.otp_attempts >= self.settings.max_attempts {
            counter!("fulfillment.otp.locked_out", 1);
            return Err(ServiceError::OtpAttemptsExceeded(format!(
                "too many failed attempts for item {}, resend a new code",
                item.id
            )));
        }

        let now = Utc::now();
        let unexpired = item.otp_expires_at.map_or(false, |expires| now <= expires);
        let matches = match item.otp_hash.as_deref() {
            Some(stored) => otp_matches(&self.settings.secret, item.id, code, stored)?,
            None => false,
        };

        if !(matches && unexpired) {
            let failed = item
                .apply(
                    &txn,
                    order_item::ActiveModel {
                        otp_attempts: Set(item.otp_attempts + 1),
                        ..Default::default()
                    },
                )
                .await?;
            txn.commit().await?;

            warn!(
                item_id = %failed.id,
                attempts = failed.otp_attempts,
                expired = !unexpired,
                "Delivery OTP rejected"
            );
            counter!("fulfillment.otp.rejected", 1);
            return Err(ServiceError::InvalidOtp(format!(
                "code for item {} is invalid or expired",
                failed.id
            )));
        }

        let delivered = item
            .apply(
                &txn,
                order_item::ActiveModel {
                    status: Set(FulfillmentStatus::Delivered),
                    delivered_at: Set(Some(now)),
                    otp_status: Set(OtpStatus::Verified),
                    otp_hash: Set(None),
                    otp_expires_at: Set(None),
                    ..Default::default()
                },
            )
            .await?;
        let refreshed = refresh_order_status(&txn, &order).await?;
        let settled = if refreshed.status == OrderStatus::Delivered
            && refreshed.payment_method == PaymentMethod::Cod
            && !refreshed.is_paid
        {
            Some(mark_paid(&txn, &refreshed).await?)
        } else {
            None
        };

        txn.commit().await?;

        info!(order_id = %order.id, item_id = %delivered.id, "Item delivered");
        counter!("fulfillment.items.delivered", 1);
        self.event_sender
            .send_or_log(Event::ItemDelivered {
                order_id: order.id,
                item_id: delivered.id,
            })
            .await;
        if let Some(paid) = settled {
            info!(order_number = %paid.order_number, "Cash-on-delivery order settled");
            self.event_sender
                .send_or_log(Event::OrderPaid {
                    order_id: paid.id,
                    payment_reference: paid.payment_reference.clone(),
                })
                .await;
        }
        Ok(delivered)
    }
}

/// Hex HMAC-SHA256 of the code, bound to the item it was issued for.
pub fn hash_otp(secret: &str, item_id: Uuid, code: &str) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid otp secret: {}", e)))?;
    mac.update(format!("{}:{}", item_id, code).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of `code` against a stored hash.
pub fn otp_matches(secret: &str, item_id: Uuid, code: &str, stored: &str) -> Result<bool, ServiceError> {
    let Ok(expected) = hex::decode(stored) else {
        return Ok(false);
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("invalid otp secret: {}", e)))?;
    mac.update(format!("{}:{}", item_id, code).as_bytes());
    Ok(mac.verify_slice(&expected).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-otp-secret-with-enough-length";

    #[test]
    fn random_codes_are_digits_of_requested_length() {
        let generator = RandomOtpGenerator;
        for length in 4..=8 {
            let code = generator.generate(length);
            assert_eq!(code.len(), length as usize);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn hashed_code_matches_only_itself() {
        let item_id = Uuid::new_v4();
        let stored = hash_otp(SECRET, item_id, "1234").unwrap();
        assert!(otp_matches(SECRET, item_id, "1234", &stored).unwrap());
        assert!(!otp_matches(SECRET, item_id, "9999", &stored).unwrap());
    }

    #[test]
    fn hash_is_bound_to_item_and_secret() {
        let item_id = Uuid::new_v4();
        let stored = hash_otp(SECRET, item_id, "1234").unwrap();
        assert!(!otp_matches(SECRET, Uuid::new_v4(), "1234", &stored).unwrap());
        assert!(!otp_matches("another-secret-of-sufficient-length!!", item_id, "1234", &stored).unwrap());
        assert!(!stored.contains("1234"));
    }

    #[test]
    fn garbage_hash_never_matches() {
        assert!(!otp_matches(SECRET, Uuid::new_v4(), "1234", "not-hex").unwrap());
    }

    #[test]
    fn settings_follow_config() {
        let mut config = AppConfig::new(
            "sqlite::memory:".to_string(),
            "127.0.0.1".to_string(),
            8080,
            "test".to_string(),
        );
        config.otp_ttl_secs = 120;
        config.otp_max_attempts = 3;
        let settings = OtpSettings::from_config(&config);
        assert_eq!(settings.ttl, Duration::seconds(120));
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.length, config.otp_length);
    }
}
