use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        cart_reconciler::CartReconcilerService,
        delivery_confirmation::{
            DeliveryConfirmationService, LoggingOtpNotifier, OtpGenerator, OtpNotifier,
            OtpSettings, RandomOtpGenerator,
        },
        fulfillment::FulfillmentService,
        order_intake::OrderIntakeService,
        payments::{
            LoggingRefundGateway, PaymentGateway, PaymentService, RefundGateway, SignatureGateway,
        },
        pricing::{DeliveryPricing, StandardDeliveryPricing},
        remediation::RemediationService,
    },
};
use std::sync::Arc;

pub mod carts;
pub mod commands;
pub mod common;
pub mod deliveries;
pub mod health;
pub mod orders;
pub mod remediation;

/// External collaborators the workflow core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub payment_gateway: Arc<dyn PaymentGateway>,
    pub refund_gateway: Arc<dyn RefundGateway>,
    pub pricing: Arc<dyn DeliveryPricing>,
    pub otp_generator: Arc<dyn OtpGenerator>,
    pub otp_notifier: Arc<dyn OtpNotifier>,
}

impl Collaborators {
    /// Default collaborators wired from configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            payment_gateway: Arc::new(SignatureGateway::new(config.payment_signing_secret())),
            refund_gateway: Arc::new(LoggingRefundGateway),
            pricing: Arc::new(StandardDeliveryPricing::from_config(config)),
            otp_generator: Arc::new(RandomOtpGenerator),
            otp_notifier: Arc::new(LoggingOtpNotifier),
        }
    }
}

/// Workflow services shared by HTTP handlers and the command dispatcher.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartReconcilerService>,
    pub intake: Arc<OrderIntakeService>,
    pub payments: Arc<PaymentService>,
    pub fulfillment: Arc<FulfillmentService>,
    pub delivery: Arc<DeliveryConfirmationService>,
    pub remediation: Arc<RemediationService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        config: &AppConfig,
        collaborators: Collaborators,
    ) -> Self {
        let payments = PaymentService::new(
            db_pool.clone(),
            event_sender.clone(),
            collaborators.payment_gateway,
        );
        let carts = CartReconcilerService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.cart_merge_replay_window_secs,
        );
        let intake = OrderIntakeService::new(
            db_pool.clone(),
            event_sender.clone(),
            collaborators.pricing,
            payments.clone(),
        );
        let fulfillment = FulfillmentService::new(db_pool.clone(), event_sender.clone());
        let delivery = DeliveryConfirmationService::new(
            db_pool.clone(),
            event_sender.clone(),
            OtpSettings::from_config(config),
            collaborators.otp_generator,
            collaborators.otp_notifier,
        );
        let remediation =
            RemediationService::new(db_pool, event_sender, collaborators.refund_gateway);

        Self {
            carts: Arc::new(carts),
            intake: Arc::new(intake),
            payments: Arc::new(payments),
            fulfillment: Arc::new(fulfillment),
            delivery: Arc::new(delivery),
            remediation: Arc::new(remediation),
        }
    }
}
