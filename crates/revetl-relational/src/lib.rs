//! Relational loader: MySQL schema bootstrap and transactional bulk inserts
//! for the normalized identity tables.

use std::collections::HashSet;

use revetl_core::{EtlError, ItemRow, ProductTypeRow, ReviewerRow};
use revetl_identity::BulkIdentities;
use sqlx::mysql::{MySqlConnection, MySqlDatabaseError, MySqlPool};
use sqlx::{Connection, Executor, MySql, QueryBuilder, Row, Transaction};
use tracing::info;

pub const CRATE_NAME: &str = "revetl-relational";

/// MySQL caps prepared-statement placeholders at 65535; two or three binds
/// per row keeps this chunk size well under the limit.
const INSERT_CHUNK: usize = 1000;

/// MySQL error number for "database exists" (ER_DB_CREATE_EXISTS).
const ER_DB_CREATE_EXISTS: u16 = 1007;

const CREATE_REVIEWERS: &str =
    "CREATE TABLE Reviewers (id VARCHAR(100), name VARCHAR(100), PRIMARY KEY (id))";
const CREATE_PRODUCTS: &str =
    "CREATE TABLE Products (id INT, type VARCHAR(100), PRIMARY KEY (id))";
const CREATE_ITEMS: &str = "CREATE TABLE Items (id INT, asin VARCHAR(100), type INT, \
     PRIMARY KEY (id), FOREIGN KEY (type) REFERENCES Products(id))";

/// Connection settings for the relational store, passed explicitly to every
/// component instead of living in process-wide state.
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    /// Server-level URL without a database path, e.g. `mysql://root@localhost:3306`.
    pub server_url: String,
    pub database: String,
}

impl RelationalConfig {
    pub fn from_env() -> Self {
        Self {
            server_url: std::env::var("REVETL_MYSQL_URL")
                .unwrap_or_else(|_| "mysql://root@localhost:3306".to_string()),
            database: std::env::var("REVETL_MYSQL_DATABASE")
                .unwrap_or_else(|_| "reviews".to_string()),
        }
    }

    pub fn database_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.database)
    }
}

/// Per-table insert counters for one load call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationalLoadSummary {
    pub reviewers_inserted: u64,
    pub products_inserted: u64,
    pub items_inserted: u64,
}

/// Creates the database and the three identity tables. Fails with an
/// integrity error if the database already exists.
pub async fn create_schema(config: &RelationalConfig) -> Result<(), EtlError> {
    let mut conn = MySqlConnection::connect(&config.server_url)
        .await
        .map_err(EtlError::connectivity)?;

    // Raw (unprepared) execution: MySQL's prepared-statement protocol does
    // not accept USE, and the bootstrap statements carry no bind values.
    conn.execute(format!("CREATE DATABASE `{}`", config.database).as_str())
        .await
        .map_err(|err| map_create_database_error(err, &config.database))?;
    conn.execute(format!("USE `{}`", config.database).as_str())
        .await
        .map_err(EtlError::connectivity)?;

    for statement in [CREATE_REVIEWERS, CREATE_PRODUCTS, CREATE_ITEMS] {
        conn.execute(statement)
            .await
            .map_err(EtlError::connectivity)?;
    }

    info!(database = %config.database, "created relational schema");
    Ok(())
}

fn map_create_database_error(err: sqlx::Error, database: &str) -> EtlError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(mysql_err) = db_err.try_downcast_ref::<MySqlDatabaseError>() {
            if mysql_err.number() == ER_DB_CREATE_EXISTS {
                return EtlError::Integrity(format!("database {database} already exists"));
            }
        }
    }
    EtlError::connectivity(err)
}

/// Pooled handle to an already-bootstrapped reviews database.
#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: MySqlPool,
}

impl RelationalStore {
    pub async fn connect(config: &RelationalConfig) -> Result<Self, EtlError> {
        let pool = MySqlPool::connect(&config.database_url())
            .await
            .map_err(EtlError::connectivity)?;
        Ok(Self { pool })
    }

    /// Every reviewer id currently persisted. An id present here blocks any
    /// new row for that id during a merge.
    pub async fn fetch_reviewer_ids(&self) -> Result<HashSet<String>, EtlError> {
        let rows = sqlx::query("SELECT id FROM Reviewers")
            .fetch_all(&self.pool)
            .await
            .map_err(EtlError::connectivity)?;
        Ok(rows.iter().map(|row| row.get::<String, _>("id")).collect())
    }

    pub async fn count_products(&self) -> Result<i64, EtlError> {
        self.count_rows("SELECT COUNT(*) FROM Products").await
    }

    pub async fn count_items(&self) -> Result<i64, EtlError> {
        self.count_rows("SELECT COUNT(*) FROM Items").await
    }

    async fn count_rows(&self, statement: &str) -> Result<i64, EtlError> {
        sqlx::query_scalar::<_, i64>(statement)
            .fetch_one(&self.pool)
            .await
            .map_err(EtlError::connectivity)
    }

    /// Inserts the identity rows of a one-time bulk load inside a single
    /// transaction, committed only after every table succeeds.
    pub async fn bulk_load(
        &self,
        identities: &BulkIdentities,
    ) -> Result<RelationalLoadSummary, EtlError> {
        let mut txn = self.pool.begin().await.map_err(EtlError::connectivity)?;

        let result = async {
            let reviewers_inserted = insert_reviewer_rows(&mut txn, &identities.reviewers).await?;
            let products_inserted =
                insert_product_rows(&mut txn, &identities.product_types).await?;
            let items_inserted = insert_item_rows(&mut txn, &identities.items).await?;
            Ok::<_, EtlError>(RelationalLoadSummary {
                reviewers_inserted,
                products_inserted,
                items_inserted,
            })
        }
        .await;

        match result {
            Ok(summary) => {
                txn.commit().await.map_err(EtlError::connectivity)?;
                info!(?summary, "bulk relational load committed");
                Ok(summary)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    /// Appends reviewer rows in their own transaction: explicit commit on
    /// success, explicit rollback on the first failure.
    pub async fn insert_reviewers(&self, rows: &[ReviewerRow]) -> Result<u64, EtlError> {
        let mut txn = self.pool.begin().await.map_err(EtlError::connectivity)?;
        match insert_reviewer_rows(&mut txn, rows).await {
            Ok(count) => {
                txn.commit().await.map_err(EtlError::connectivity)?;
                Ok(count)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    pub async fn insert_products(&self, rows: &[ProductTypeRow]) -> Result<u64, EtlError> {
        let mut txn = self.pool.begin().await.map_err(EtlError::connectivity)?;
        match insert_product_rows(&mut txn, rows).await {
            Ok(count) => {
                txn.commit().await.map_err(EtlError::connectivity)?;
                Ok(count)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }

    pub async fn insert_items(&self, rows: &[ItemRow]) -> Result<u64, EtlError> {
        let mut txn = self.pool.begin().await.map_err(EtlError::connectivity)?;
        match insert_item_rows(&mut txn, rows).await {
            Ok(count) => {
                txn.commit().await.map_err(EtlError::connectivity)?;
                Ok(count)
            }
            Err(err) => {
                let _ = txn.rollback().await;
                Err(err)
            }
        }
    }
}

async fn insert_reviewer_rows(
    txn: &mut Transaction<'_, MySql>,
    rows: &[ReviewerRow],
) -> Result<u64, EtlError> {
    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut builder = QueryBuilder::<MySql>::new("INSERT INTO Reviewers (id, name) ");
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(&row.id).push_bind(&row.name);
        });
        inserted += builder
            .build()
            .execute(&mut **txn)
            .await
            .map_err(EtlError::connectivity)?
            .rows_affected();
    }
    Ok(inserted)
}

async fn insert_product_rows(
    txn: &mut Transaction<'_, MySql>,
    rows: &[ProductTypeRow],
) -> Result<u64, EtlError> {
    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut builder = QueryBuilder::<MySql>::new("INSERT INTO Products (id, type) ");
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.id).push_bind(&row.label);
        });
        inserted += builder
            .build()
            .execute(&mut **txn)
            .await
            .map_err(EtlError::connectivity)?
            .rows_affected();
    }
    Ok(inserted)
}

async fn insert_item_rows(
    txn: &mut Transaction<'_, MySql>,
    rows: &[ItemRow],
) -> Result<u64, EtlError> {
    let mut inserted = 0;
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut builder = QueryBuilder::<MySql>::new("INSERT INTO Items (id, asin, type) ");
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.id).push_bind(&row.asin).push_bind(row.product_type);
        });
        inserted += builder
            .build()
            .execute(&mut **txn)
            .await
            .map_err(EtlError::connectivity)?
            .rows_affected();
    }
    Ok(inserted)
}
