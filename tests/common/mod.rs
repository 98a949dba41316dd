#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use fulfillment_api::{
    auth::{Actor, ACTOR_ID_HEADER, ACTOR_ROLE_HEADER},
    config::AppConfig,
    db,
    entities::{
        order::{self, PaymentMethod, ShippingAddress},
        order_item::{self, FulfillmentStatus},
        product_variant,
    },
    errors::ServiceError,
    events::{self, EventHandler, EventSender},
    handlers::{AppServices, Collaborators},
    services::{
        delivery_confirmation::{FixedOtpGenerator, OtpNotifier},
        order_intake::{CreateOrderRequest, OrderLine},
        payments::{RefundGateway, RefundInstruction, SignatureGateway},
        pricing::StandardDeliveryPricing,
        OrderDetails,
    },
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_OTP: &str = "1234";
pub const TEST_PAYMENT_SECRET: &str = "integration-test-payment-secret";

/// Refund collaborator whose availability and latency can be changed mid-test.
#[derive(Default)]
pub struct ToggleRefundGateway {
    failing: AtomicBool,
    delay_ms: AtomicU64,
    issued: Mutex<Vec<RefundInstruction>>,
}

impl ToggleRefundGateway {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<RefundInstruction> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl RefundGateway for ToggleRefundGateway {
    async fn refund(&self, instruction: &RefundInstruction) -> Result<String, ServiceError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::ExternalServiceError(
                "refund provider unavailable".to_string(),
            ));
        }
        self.issued.lock().unwrap().push(instruction.clone());
        Ok(format!("rf_test_{}", instruction.return_id.simple()))
    }
}

/// Records every code handed to a customer.
#[derive(Default)]
pub struct CapturingNotifier {
    sent: Mutex<Vec<(Uuid, String)>>,
}

impl CapturingNotifier {
    pub fn sent(&self) -> Vec<(Uuid, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OtpNotifier for CapturingNotifier {
    async fn deliver(
        &self,
        _order: &order::Model,
        item: &order_item::Model,
        code: &str,
    ) -> Result<(), ServiceError> {
        self.sent.lock().unwrap().push((item.id, code.to_string()));
        Ok(())
    }
}

/// Collects emitted domain events.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<events::Event>>,
}

impl RecordingHandler {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, event: &events::Event) -> Result<(), String> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Application state over a fresh SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub refunds: Arc<ToggleRefundGateway>,
    pub notifier: Arc<CapturingNotifier>,
    pub recorder: Arc<RecordingHandler>,
    pub gateway: Arc<SignatureGateway>,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: Option<TempDir>,
}

impl TestApp {
    /// In-memory database behind a single pooled connection.
    pub async fn new() -> Self {
        Self::build("sqlite::memory:".to_string(), 1, None).await
    }

    /// File-backed database with several pooled connections, so concurrent
    /// requests contend for real.
    pub async fn file_backed() -> Self {
        let dir = tempfile::tempdir().expect("temp dir for test database");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("fulfillment.db").display()
        );
        Self::build(url, 4, Some(dir)).await
    }

    async fn build(database_url: String, connections: u32, db_dir: Option<TempDir>) -> Self {
        let mut cfg = AppConfig::new(
            database_url,
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = connections;
        cfg.db_min_connections = 1;
        cfg.payment_webhook_secret = Some(TEST_PAYMENT_SECRET.to_string());
        cfg.otp_max_attempts = 3;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let recorder = Arc::new(RecordingHandler::default());
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let handlers: Vec<Arc<dyn EventHandler>> = vec![recorder.clone() as Arc<dyn EventHandler>];
        let event_task = tokio::spawn(events::process_events(event_rx, handlers));

        let refunds = Arc::new(ToggleRefundGateway::default());
        let notifier = Arc::new(CapturingNotifier::default());
        let gateway = Arc::new(SignatureGateway::new(TEST_PAYMENT_SECRET));
        let collaborators = Collaborators {
            payment_gateway: gateway.clone(),
            refund_gateway: refunds.clone(),
            pricing: Arc::new(StandardDeliveryPricing::from_config(&cfg)),
            otp_generator: Arc::new(FixedOtpGenerator(TEST_OTP.to_string())),
            otp_notifier: notifier.clone(),
        };

        let state = AppState::new(db_arc, cfg, event_sender, collaborators);
        let router = fulfillment_api::build_router(state.clone());

        Self {
            router,
            state,
            refunds,
            notifier,
            recorder,
            gateway,
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    /// Send a request against the router, optionally as `actor`.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        actor: Option<Actor>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(actor) = actor {
            builder = builder
                .header(ACTOR_ID_HEADER, actor.id.to_string())
                .header(ACTOR_ROLE_HEADER, actor.role.to_string());
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_variant(&self, sku: &str, price: Decimal, stock: i32) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("Variant {}", sku)),
            price: Set(price),
            stock: Set(stock),
            is_active: Set(true),
            allow_return: Set(true),
            return_days: Set(7),
            allow_replacement: Set(true),
            replacement_days: Set(7),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product variant for tests")
    }

    pub async fn stock_of(&self, variant_id: Uuid) -> i32 {
        product_variant::Entity::find_by_id(variant_id)
            .one(self.db())
            .await
            .expect("query variant")
            .expect("variant exists")
            .stock
    }

    pub async fn item(&self, item_id: Uuid) -> order_item::Model {
        order_item::Entity::find_by_id(item_id)
            .one(self.db())
            .await
            .expect("query item")
            .expect("item exists")
    }

    pub async fn place_order(
        &self,
        customer: Actor,
        lines: &[(Uuid, i32)],
        payment_method: PaymentMethod,
    ) -> Result<OrderDetails, ServiceError> {
        let request = CreateOrderRequest {
            items: lines
                .iter()
                .map(|(variant_id, quantity)| OrderLine {
                    variant_id: *variant_id,
                    quantity: *quantity,
                })
                .collect(),
            shipping_address: address(),
            payment_method,
        };
        self.services().intake.create_order(customer, request).await
    }

    /// Walks every item of the order through pick, pack and ship.
    pub async fn ship_all(&self, details: &OrderDetails) {
        let warehouse = Actor::warehouse(Uuid::new_v4());
        for item in &details.items {
            for target in [
                FulfillmentStatus::Picked,
                FulfillmentStatus::Packed,
                FulfillmentStatus::Shipped,
            ] {
                self.services()
                    .fulfillment
                    .advance_item(warehouse, item.id, target)
                    .await
                    .expect("warehouse step");
            }
        }
    }

    /// Ships the order and hands it to a fresh delivery agent.
    pub async fn dispatch(&self, details: &OrderDetails) -> Actor {
        self.ship_all(details).await;
        let agent = Actor::delivery_agent(Uuid::new_v4());
        self.services()
            .fulfillment
            .assign_delivery_agent(Actor::admin(Uuid::new_v4()), &details.order.order_number, agent.id)
            .await
            .expect("assign agent");
        agent
    }

    /// Places a single-line COD order and delivers it through the OTP gate.
    pub async fn delivered_order(&self, customer: Actor, variant_id: Uuid) -> (OrderDetails, Actor) {
        let details = self
            .place_order(customer, &[(variant_id, 1)], PaymentMethod::Cod)
            .await
            .expect("place order");
        let agent = self.dispatch(&details).await;
        let item_id = details.items[0].id;
        self.services()
            .delivery
            .send_otp(agent, item_id)
            .await
            .expect("send otp");
        self.services()
            .delivery
            .verify_otp(agent, item_id, TEST_OTP)
            .await
            .expect("verify otp");
        let refreshed = self
            .services()
            .fulfillment
            .get_order(customer, &details.order.order_number)
            .await
            .expect("reload order");
        (refreshed, agent)
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub fn address() -> ShippingAddress {
    ShippingAddress {
        name: "Asha Rao".to_string(),
        line1: "12 Lake Road".to_string(),
        line2: None,
        city: "Pune".to_string(),
        state: "MH".to_string(),
        postal_code: "411001".to_string(),
        country: "IN".to_string(),
        phone: Some("+919800000000".to_string()),
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
