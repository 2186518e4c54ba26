//! Database sessions
//!
//! [`Session`] is the seam between the connector and the PostgreSQL driver:
//! plain query/execute, named prepared statements, and liveness. The
//! connector's retry, reconnect and batch logic is written against the trait,
//! so tests can substitute a scripted session without a live database.
//!
//! [`PgSession`] is the tokio-postgres implementation. Connecting applies TCP
//! keepalives, pins the session to READ COMMITTED and logs the server
//! version. Driver errors are classified by SQLSTATE so the retry loop can
//! tell transient failures from real query errors.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Statement};
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Resolved host/port the session dials (tunnel local port or direct address)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host to dial
    pub host: String,
    /// Port to dial
    pub port: u16,
}

impl Endpoint {
    /// Endpoint on localhost, used for tunneled access
    pub fn local(port: u16) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
        }
    }
}

/// One database session
#[async_trait]
pub trait Session: Send {
    /// Run a row-returning statement
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a statement and return the affected row count
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Prepare a named statement; preparing the same name again is a no-op
    async fn prepare(&mut self, name: &str, sql: &str) -> Result<()>;

    /// Run a previously prepared row-returning statement
    async fn query_prepared(&mut self, name: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a previously prepared statement and return the affected row count
    async fn execute_prepared(&mut self, name: &str, params: &[Value]) -> Result<u64>;

    /// Whether the session has been lost or closed
    fn is_closed(&self) -> bool;

    /// Close the session
    async fn close(&mut self);
}

/// Opens sessions against an endpoint
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a new session
    async fn connect(&self, endpoint: &Endpoint, config: &TargetConfig)
        -> Result<Box<dyn Session>>;
}

/// Classify a driver error by SQLSTATE for retry handling
pub(crate) fn classify_pg_error(err: tokio_postgres::Error, sql: Option<&str>) -> Error {
    if let Some(state) = err.code() {
        if *state == SqlState::T_R_DEADLOCK_DETECTED {
            return Error::Deadlock;
        }
        if *state == SqlState::IN_FAILED_SQL_TRANSACTION {
            return Error::FailedTransaction;
        }
        match &state.code()[..2] {
            // connection exceptions
            "08" => return Error::connection_with_source(state.code().to_string(), err),
            // insufficient resources, operator intervention, system errors
            "53" | "57" | "58" => {
                return Error::Operational {
                    message: format!("{} ({})", err, state.code()),
                }
            }
            _ => {}
        }
        return Error::Query {
            message: err.to_string(),
            sql: sql.map(ToString::to_string),
            source: Some(Box::new(err)),
        };
    }

    // No SQLSTATE: socket-level failure, treat as a lost connection
    Error::connection_with_source("connection failure", err)
}

/// Convert a [`Value`] to a tokio-postgres parameter
fn value_to_sql(value: &Value) -> Box<dyn tokio_postgres::types::ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
        Value::Array(arr) => {
            let json = serde_json::to_value(arr).unwrap_or_default();
            Box::new(json)
        }
    }
}

fn to_param_refs(
    boxed: &[Box<dyn tokio_postgres::types::ToSql + Sync + Send>],
) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect()
}

/// Convert a tokio-postgres row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn pg_value_to_value(
    row: &tokio_postgres::Row,
    idx: usize,
    pg_type: &tokio_postgres::types::Type,
) -> Value {
    use tokio_postgres::types::Type;

    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(Value::Int16)
            .unwrap_or(Value::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(Value::Int32)
            .unwrap_or(Value::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Int64)
            .unwrap_or(Value::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(Value::Float32)
            .unwrap_or(Value::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float64)
            .unwrap_or(Value::Null),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(Value::Time)
            .unwrap_or(Value::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTimeTz)
            .unwrap_or(Value::Null),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)
            .ok()
            .flatten()
            .map(Value::Uuid)
            .unwrap_or(Value::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(Value::Json)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// tokio-postgres session
pub struct PgSession {
    client: tokio_postgres::Client,
    statements: HashMap<String, Statement>,
}

impl PgSession {
    fn statement(&self, name: &str) -> Result<Statement> {
        self.statements
            .get(name)
            .cloned()
            .ok_or_else(|| Error::query(format!("statement {name} is not prepared")))
    }
}

#[async_trait]
impl Session for PgSession {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let boxed: Vec<_> = params.iter().map(value_to_sql).collect();
        let pg_rows = self
            .client
            .query(sql, &to_param_refs(&boxed))
            .await
            .map_err(|e| classify_pg_error(e, Some(sql)))?;
        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let boxed: Vec<_> = params.iter().map(value_to_sql).collect();
        self.client
            .execute(sql, &to_param_refs(&boxed))
            .await
            .map_err(|e| classify_pg_error(e, Some(sql)))
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<()> {
        if self.statements.contains_key(name) {
            return Ok(());
        }
        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| classify_pg_error(e, Some(sql)))?;
        debug!("prepared statement {name}");
        self.statements.insert(name.to_string(), stmt);
        Ok(())
    }

    async fn query_prepared(&mut self, name: &str, params: &[Value]) -> Result<Vec<Row>> {
        let stmt = self.statement(name)?;
        let boxed: Vec<_> = params.iter().map(value_to_sql).collect();
        let pg_rows = self
            .client
            .query(&stmt, &to_param_refs(&boxed))
            .await
            .map_err(|e| classify_pg_error(e, None))?;
        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute_prepared(&mut self, name: &str, params: &[Value]) -> Result<u64> {
        let stmt = self.statement(name)?;
        let boxed: Vec<_> = params.iter().map(value_to_sql).collect();
        self.client
            .execute(&stmt, &to_param_refs(&boxed))
            .await
            .map_err(|e| classify_pg_error(e, None))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    async fn close(&mut self) {
        // Dropping the client ends the connection task; nothing to flush.
        self.statements.clear();
    }
}

/// Opens [`PgSession`]s with keepalives and READ COMMITTED isolation
#[derive(Debug, Default, Clone, Copy)]
pub struct PgSessionFactory;

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        config: &TargetConfig,
    ) -> Result<Box<dyn Session>> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&endpoint.host)
            .port(endpoint.port)
            .dbname(&config.dbname)
            .user(&config.user)
            .password(&config.password)
            .connect_timeout(Duration::from_secs(10))
            .keepalives(true)
            .keepalives_idle(Duration::from_secs(30))
            .keepalives_interval(Duration::from_secs(10))
            .keepalives_retries(5);

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| classify_pg_error(e, None))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("connection task ended: {e}");
            }
        });

        client
            .batch_execute("SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .await
            .map_err(|e| classify_pg_error(e, None))?;

        if let Ok(rows) = client.query("SELECT version()", &[]).await {
            if let Some(row) = rows.first() {
                let version: Option<String> = row.try_get(0).ok();
                info!(
                    "connected to {}:{} ({})",
                    endpoint.host,
                    endpoint.port,
                    version.unwrap_or_default()
                );
            }
        }

        Ok(Box::new(PgSession {
            client,
            statements: HashMap::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_local() {
        let e = Endpoint::local(30123);
        assert_eq!(e.host, "localhost");
        assert_eq!(e.port, 30123);
    }
}
