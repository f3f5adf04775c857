//! PostgreSQL relational store.
//!
//! Uses a `deadpool-postgres` pool whose wait, create and recycle timeouts
//! all equal the configured acquire timeout, so a dead server surfaces as an
//! error instead of a hung caller.

use crate::config::DatabaseConfig;
use crate::storage::traits::{PoolStats, RelationalStore, Row};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Statement};

type Param = Box<dyn ToSql + Sync + Send>;

/// Helper to map pool errors.
fn pool_error(e: impl std::fmt::Display) -> Error {
    Error::OperationFailed {
        operation: "postgres_get_client".to_string(),
        cause: e.to_string(),
    }
}

/// Helper to map query errors.
fn query_error(op: &str, e: impl std::fmt::Display) -> Error {
    Error::OperationFailed {
        operation: op.to_string(),
        cause: e.to_string(),
    }
}

/// PostgreSQL-backed [`RelationalStore`].
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Creates the pool. No connection is opened until first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no URL is configured or it does
    /// not parse, or an error if the pool cannot be built.
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| Error::Configuration("database.url is not set".to_string()))?;
        let url = url.expose_secret();
        Self::parse_connection_url(url)?;

        let cfg = Self::build_pool_config(url, config);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::OperationFailed {
                operation: "postgres_create_pool".to_string(),
                cause: e.to_string(),
            })?;

        tracing::debug!(
            max_size = config.pool_max_size,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "PostgreSQL pool created"
        );
        Ok(Self { pool })
    }

    /// Validates the connection URL without logging it.
    fn parse_connection_url(url: &str) -> Result<tokio_postgres::Config> {
        url.parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Configuration(format!("invalid database url: {e}")))
    }

    /// Builds a deadpool config with bounded pool size and acquire timeouts.
    fn build_pool_config(url: &str, config: &DatabaseConfig) -> Config {
        let mut cfg = Config::new();
        cfg.url = Some(url.to_string());

        let acquire = config.acquire_timeout();
        cfg.pool = Some(PoolConfig {
            max_size: config.pool_max_size,
            timeouts: Timeouts {
                wait: Some(acquire),
                create: Some(acquire),
                recycle: Some(acquire),
            },
            ..Default::default()
        });

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        cfg
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn query(&self, text: &str, params: &[Value]) -> Result<Vec<Row>> {
        let client = self.pool.get().await.map_err(pool_error)?;
        let statement = client
            .prepare(text)
            .await
            .map_err(|e| query_error("postgres_prepare", e))?;
        let bound = bind_params(&statement, params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = client
            .query(&statement, &refs)
            .await
            .map_err(|e| query_error("postgres_query", e))?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn transaction(&self, statements: &[(String, Vec<Value>)]) -> Result<Vec<Vec<Row>>> {
        let mut client = self.pool.get().await.map_err(pool_error)?;
        let tx = client
            .transaction()
            .await
            .map_err(|e| query_error("postgres_begin", e))?;

        let mut results = Vec::with_capacity(statements.len());
        for (text, params) in statements {
            let statement = tx
                .prepare(text)
                .await
                .map_err(|e| query_error("postgres_prepare", e))?;
            let bound = bind_params(&statement, params)?;
            let refs: Vec<&(dyn ToSql + Sync)> = bound
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            // Dropping `tx` on error rolls the transaction back.
            let rows = tx
                .query(&statement, &refs)
                .await
                .map_err(|e| query_error("postgres_transaction_query", e))?;
            results.push(rows.iter().map(row_to_json).collect());
        }

        tx.commit()
            .await
            .map_err(|e| query_error("postgres_commit", e))?;
        Ok(results)
    }

    async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await.map_err(pool_error)?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| query_error("postgres_ping", e))?;
        Ok(())
    }

    fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            max_size: status.max_size,
            size: status.size,
            active: status.size.saturating_sub(status.available),
            idle: status.available,
            waiting: status.waiting,
        }
    }

    async fn close(&self) {
        self.pool.close();
        tracing::debug!("PostgreSQL pool closed");
    }
}

/// Converts JSON parameters to the statement's declared parameter types.
fn bind_params(statement: &Statement, params: &[Value]) -> Result<Vec<Param>> {
    let types = statement.params();
    if types.len() != params.len() {
        return Err(Error::InvalidInput(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            params.len()
        )));
    }
    types
        .iter()
        .zip(params)
        .enumerate()
        .map(|(index, (ty, value))| to_sql_param(index, ty, value))
        .collect()
}

/// Returns `None` for JSON null, the converted value, or an error naming the parameter.
fn convert<T>(
    index: usize,
    ty: &Type,
    value: &Value,
    f: impl FnOnce(&Value) -> Option<T>,
) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    f(value).map(Some).ok_or_else(|| {
        Error::InvalidInput(format!("parameter ${} cannot be converted to {ty}", index + 1))
    })
}

#[allow(clippy::cast_possible_truncation)]
fn to_sql_param(index: usize, ty: &Type, value: &Value) -> Result<Param> {
    let param: Param = match *ty {
        Type::BOOL => Box::new(convert(index, ty, value, Value::as_bool)?),
        Type::INT2 => Box::new(convert(index, ty, value, |v| {
            v.as_i64().and_then(|n| i16::try_from(n).ok())
        })?),
        Type::INT4 => Box::new(convert(index, ty, value, |v| {
            v.as_i64().and_then(|n| i32::try_from(n).ok())
        })?),
        Type::INT8 => Box::new(convert(index, ty, value, Value::as_i64)?),
        Type::FLOAT4 => Box::new(convert(index, ty, value, |v| v.as_f64().map(|n| n as f32))?),
        Type::FLOAT8 => Box::new(convert(index, ty, value, Value::as_f64)?),
        Type::JSON | Type::JSONB => Box::new(convert(index, ty, value, |v| Some(v.clone()))?),
        Type::UUID => Box::new(convert(index, ty, value, |v| {
            v.as_str().and_then(|s| uuid::Uuid::parse_str(s).ok())
        })?),
        Type::TIMESTAMPTZ => Box::new(convert(index, ty, value, |v| {
            v.as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        })?),
        _ => Box::new(convert(index, ty, value, |v| {
            Some(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })?),
    };
    Ok(param)
}

/// Converts a driver row to a JSON object keyed by column name.
fn row_to_json(row: &tokio_postgres::Row) -> Row {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), column_to_json(row, index, column.type_()));
    }
    out
}

fn column_to_json(row: &tokio_postgres::Row, index: usize, ty: &Type) -> Value {
    fn get<'a, T>(row: &'a tokio_postgres::Row, index: usize) -> Option<T>
    where
        T: tokio_postgres::types::FromSql<'a>,
    {
        row.try_get::<_, Option<T>>(index).ok().flatten()
    }

    match *ty {
        Type::BOOL => get::<bool>(row, index).map_or(Value::Null, Value::Bool),
        Type::INT2 => get::<i16>(row, index).map_or(Value::Null, Value::from),
        Type::INT4 => get::<i32>(row, index).map_or(Value::Null, Value::from),
        Type::INT8 => get::<i64>(row, index).map_or(Value::Null, Value::from),
        Type::FLOAT4 => get::<f32>(row, index).map_or(Value::Null, Value::from),
        Type::FLOAT8 => get::<f64>(row, index).map_or(Value::Null, Value::from),
        Type::JSON | Type::JSONB => get::<Value>(row, index).unwrap_or(Value::Null),
        Type::UUID => get::<uuid::Uuid>(row, index).map_or(Value::Null, |u| Value::String(u.to_string())),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, index)
            .map_or(Value::Null, |dt| Value::String(dt.to_rfc3339())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, index)
            .map_or(Value::Null, |dt| Value::String(dt.to_string())),
        Type::DATE => get::<NaiveDate>(row, index).map_or(Value::Null, |d| Value::String(d.to_string())),
        _ => get::<String>(row, index).map_or(Value::Null, Value::String),
    }
}
