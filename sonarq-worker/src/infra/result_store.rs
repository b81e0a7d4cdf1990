//! Postgres persistence for mapped scan results.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use sonarq_core::{
    ScanResult,
    error::{Result, ScanError},
    scan::ResultStore,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{debug, info};
use uuid::Uuid;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const INSERT_RESULT: &str = r#"
    INSERT INTO scan_results (
        id, name, scale_rating, security_review_rating, reliability_rating,
        code_smells, bugs, vulnerabilities, coverage, security_rating,
        security_hotspots, complexity
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
"#;

pub fn database_error(err: sqlx::Error) -> ScanError {
    ScanError::Database(err.to_string())
}

/// Open a pool sized for `max_connections` concurrent scans.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .test_before_acquire(true)
        .connect(url)
        .await
        .map_err(database_error)?;
    info!(max_connections, "database pool initialized");
    Ok(pool)
}

#[derive(Clone)]
pub struct PostgresResultStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresResultStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresResultStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    async fn save(&self, result: &ScanResult) -> Result<bool> {
        let id = Uuid::now_v7();
        let outcome = sqlx::query(INSERT_RESULT)
            .bind(id)
            .bind(&result.name)
            .bind(result.scale_rating)
            .bind(result.security_review_rating)
            .bind(result.reliability_rating)
            .bind(result.code_smells)
            .bind(result.bugs)
            .bind(result.vulnerabilities)
            .bind(result.coverage)
            .bind(result.security_rating)
            .bind(result.security_hotspots)
            .bind(result.complexity)
            .execute(&self.pool)
            .await
            .map_err(database_error)?;

        debug!(%id, name = %result.name, rows = outcome.rows_affected(), "scan result inserted");
        Ok(outcome.rows_affected() > 0)
    }
}
