use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge};
use sea_orm::{
    ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, DbErr, TransactionError,
    TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Type alias for a database connection pool
pub type DbPool = DatabaseConnection;

/// Boxed future handed to [`transaction`] callbacks
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Configuration for database connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Idle timeout duration
    pub idle_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

impl From<&AppConfig> for DbConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            url: cfg.database_url.clone(),
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Establishes a connection pool to the database with custom configuration
///
/// # Errors
/// Returns a `ServiceError::DatabaseError` if the connection cannot be established
pub async fn establish_connection_with_config(config: &DbConfig) -> Result<DbPool, ServiceError> {
    debug!("Configuring database connection with: {:?}", config);

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .sqlx_logging(false);

    gauge!("fulfillment_db.max_connections", config.max_connections as f64);

    info!(
        "Connecting to database with max_connections={}",
        config.max_connections
    );

    let db_pool = Database::connect(opt).await?;

    info!("Database connection pool established successfully");
    Ok(db_pool)
}

/// Establish DB pool using AppConfig tuning
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    let db_cfg: DbConfig = cfg.into();
    establish_connection_with_config(&db_cfg).await
}

/// Runs `f` inside a database transaction.
///
/// The transaction commits when `f` returns `Ok` and rolls back otherwise;
/// connection-level failures surface as `ServiceError::DatabaseError`.
pub async fn transaction<F, T>(db: &DatabaseConnection, f: F) -> Result<T, ServiceError>
where
    F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T, ServiceError>> + Send,
    T: Send,
{
    let result = db.transaction::<_, T, ServiceError>(f).await;

    match &result {
        Ok(_) => {
            counter!("fulfillment_db.transaction.committed", 1);
        }
        Err(_) => {
            counter!("fulfillment_db.transaction.rolled_back", 1);
        }
    }

    result.map_err(|e| match e {
        TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
        TransactionError::Transaction(service_err) => service_err,
    })
}

/// Runs database migrations
///
/// # Errors
/// Returns the underlying `DbErr` if any migration fails
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbErr> {
    info!("Running database migrations");
    let start = std::time::Instant::now();

    let result = crate::migrator::Migrator::up(pool, None).await;

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => info!(
            "Database migrations completed successfully in {:?}",
            elapsed
        ),
        Err(e) => error!("Database migrations failed after {:?}: {}", elapsed, e),
    }

    result
}

/// Checks if the database connection is active
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    debug!("Checking database connection");
    let start = std::time::Instant::now();

    let result = pool.ping().await.map_err(ServiceError::DatabaseError);

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            debug!("Database connection check successful in {:?}", elapsed);
            gauge!("fulfillment_db.connection_latency", elapsed.as_millis() as f64);
        }
        Err(e) => {
            warn!(
                "Database connection check failed after {:?}: {}",
                elapsed, e
            );
            counter!("fulfillment_db.connection_failures", 1);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectionTrait, Statement};

    async fn memory_pool() -> DbPool {
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            ..Default::default()
        };
        establish_connection_with_config(&config)
            .await
            .expect("in-memory sqlite")
    }

    #[tokio::test]
    async fn connection_check_succeeds_on_memory_db() {
        let pool = memory_pool().await;
        assert!(check_connection(&pool).await.is_ok());
        assert!(run_migrations(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn migrations_are_idempotent_on_file_database() {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("fulfillment.db").display()
        );
        let config = DbConfig {
            url,
            max_connections: 1,
            ..Default::default()
        };

        let pool = establish_connection_with_config(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
        drop(pool);

        let reopened = establish_connection_with_config(&config).await.unwrap();
        assert!(run_migrations(&reopened).await.is_ok());
        assert!(check_connection(&reopened).await.is_ok());
    }

    #[tokio::test]
    async fn money_columns_keep_four_decimal_places() {
        use crate::entities::product_variant;
        use rust_decimal_macros::dec;
        use sea_orm::{ActiveModelTrait, EntityTrait, Set};

        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();

        let now = chrono::Utc::now();
        let id = uuid::Uuid::new_v4();
        product_variant::ActiveModel {
            id: Set(id),
            product_id: Set(uuid::Uuid::new_v4()),
            sku: Set("PRICE-4DP".to_string()),
            name: Set("Four places".to_string()),
            price: Set(dec!(1234.0625)),
            stock: Set(1),
            is_active: Set(true),
            allow_return: Set(true),
            return_days: Set(7),
            allow_replacement: Set(true),
            replacement_days: Set(7),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&pool)
        .await
        .unwrap();

        let stored = product_variant::Entity::find_by_id(id)
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.price, dec!(1234.0625));
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_service_error() {
        let pool = memory_pool().await;
        pool.execute_unprepared("CREATE TABLE marks (n INTEGER NOT NULL)")
            .await
            .unwrap();

        let result: Result<(), ServiceError> = transaction(&pool, |txn| {
            Box::pin(async move {
                txn.execute_unprepared("INSERT INTO marks (n) VALUES (1)")
                    .await?;
                Err(ServiceError::InvalidTransition("abort".into()))
            })
        })
        .await;
        assert!(matches!(result, Err(ServiceError::InvalidTransition(_))));

        let row = pool
            .query_one(Statement::from_string(
                pool.get_database_backend(),
                "SELECT COUNT(*) AS c FROM marks".to_string(),
            ))
            .await
            .unwrap()
            .unwrap();
        let count: i64 = row.try_get("", "c").unwrap();
        assert_eq!(count, 0);
    }
}
