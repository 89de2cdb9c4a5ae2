//! ClickHouse connections over the native protocol.
//!
//! [`Connector`] and [`Connection`] are the seam the client talks to;
//! [`NativeConnector`] implements them with klickhouse.

use crate::error::BurrowError;
use crate::models::{ConnectionConfig, Endpoint, QueryResult};

use async_trait::async_trait;
use futures_util::StreamExt;
use klickhouse::{Client, ClientOptions};
use serde_json::{Number, Value as JsonValue};
use std::time::{Duration, Instant};

/// Opens database connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `endpoint` with the credentials and database from `config`.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn Connection>, BurrowError>;
}

/// An open database session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute `sql` and materialize every returned row.
    async fn fetch_all(&self, sql: &str) -> Result<QueryResult, BurrowError>;
}

/// Connects with the klickhouse native client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

#[async_trait]
impl Connector for NativeConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        endpoint: &Endpoint,
    ) -> Result<Box<dyn Connection>, BurrowError> {
        let options = ClientOptions {
            username: config.user.clone(),
            password: config.password.clone(),
            default_database: config.database.clone(),
            ..Default::default()
        };

        let connect_timeout = Duration::from_secs(config.options.connect_timeout_secs);
        let connect = Client::connect(endpoint.to_string(), options);
        let client = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| {
                BurrowError::connection(format!(
                    "Timed out after {}s connecting to {}",
                    connect_timeout.as_secs(),
                    config.display_url(endpoint)
                ))
            })?
            .map_err(|e| {
                BurrowError::connection_with_source(
                    format!("Failed to connect to {}: {e}", config.display_url(endpoint)),
                    e,
                )
            })?;

        tracing::debug!(
            endpoint = %endpoint,
            database = %config.database,
            "Native connection established"
        );

        Ok(Box::new(NativeConnection { client }))
    }
}

/// A klickhouse client session.
pub struct NativeConnection {
    client: Client,
}

#[async_trait]
impl Connection for NativeConnection {
    async fn fetch_all(&self, sql: &str) -> Result<QueryResult, BurrowError> {
        let start = Instant::now();

        let mut blocks = self
            .client
            .query_raw(sql.to_string())
            .await
            .map_err(|e| BurrowError::query(e.to_string(), None))?;

        let mut columns: Option<Vec<String>> = None;
        let mut rows: Vec<Vec<JsonValue>> = Vec::new();

        while let Some(block) = blocks.next().await {
            let block = block.map_err(|e| BurrowError::query(e.to_string(), None))?;
            let row_count = block.rows;

            // The header block carries column names but no rows
            if columns.is_none() {
                columns = Some(block.column_data.keys().cloned().collect());
            }
            if row_count == 0 {
                continue;
            }

            let mut cells: Vec<_> = block
                .column_data
                .into_values()
                .map(|values| values.into_iter().map(convert_value))
                .collect();

            for _ in 0..row_count {
                let row: Vec<JsonValue> = cells
                    .iter_mut()
                    .map(|column| column.next().unwrap_or(JsonValue::Null))
                    .collect();
                rows.push(row);
            }
        }

        let execution_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(execution_time_ms, row_count = rows.len(), "Query completed");

        Ok(QueryResult::new(columns.unwrap_or_default(), rows)?
            .with_execution_time_ms(execution_time_ms))
    }
}

/// Convert a klickhouse value to JSON.
///
/// Numbers and strings map directly; everything else uses the driver's
/// text rendering.
fn convert_value(value: klickhouse::Value) -> JsonValue {
    use klickhouse::Value;

    match value {
        Value::Null => JsonValue::Null,
        Value::UInt8(v) => JsonValue::from(v),
        Value::UInt16(v) => JsonValue::from(v),
        Value::UInt32(v) => JsonValue::from(v),
        Value::UInt64(v) => JsonValue::from(v),
        Value::Int8(v) => JsonValue::from(v),
        Value::Int16(v) => JsonValue::from(v),
        Value::Int32(v) => JsonValue::from(v),
        Value::Int64(v) => JsonValue::from(v),
        Value::Float32(v) => float_value(f64::from(v)),
        Value::Float64(v) => float_value(v),
        Value::String(bytes) => JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()),
        other => JsonValue::String(other.to_string()),
    }
}

/// NaN and infinities have no JSON form.
fn float_value(v: f64) -> JsonValue {
    Number::from_f64(v).map(JsonValue::Number).unwrap_or(JsonValue::Null)
}
