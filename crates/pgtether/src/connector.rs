//! Resilient database connector
//!
//! [`DbConnector`] owns the whole access path: the port-forward tunnel (when
//! the target is reached through a pod), a primary session all queries run
//! on, a bounded pool of extra sessions, and the prepared statement registry.
//!
//! Query execution is defensive by default:
//! - transient failures (deadlock, aborted transaction, lost connection,
//!   operational errors) are rolled back and retried with exponential
//!   backoff, re-establishing the tunnel and session when the failure is
//!   connection-class
//! - large parameterized inserts are redirected to the chunked batch path
//! - statements running longer than the slow-query threshold are logged
//!
//! Batch inserts commit per chunk. A failure mid-way leaves earlier chunks
//! committed; callers needing atomicity across the whole load must wrap the
//! insert in [`DbConnector::transaction`] themselves.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{AccessMode, TargetConfig};
use crate::error::{Error, Result};
use crate::pool::{PooledSession, SessionPool};
use crate::retry::RetryPolicy;
use crate::session::{Endpoint, PgSessionFactory, Session, SessionFactory};
use crate::sql::{
    build_multi_insert, escape_single_quotes, parse_insert, statement_key, truncate_sql, QueryKind,
};
use crate::tunnel::{self, Tunnel};
use crate::types::{FetchMode, QueryOutput, Row, Value};

/// Default rows per batch insert round trip
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Parameter count above which a plain insert is redirected to the batch path
const BULK_REDIRECT_THRESHOLD: usize = 10;

/// Statements slower than this are logged
const SLOW_QUERY: Duration = Duration::from_secs(5);

/// Statement preview length in logs and errors
const SQL_PREVIEW: usize = 500;

/// Per-call options for [`DbConnector::run_query`]
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Result shape for row-returning statements
    pub fetch: FetchMode,
    /// Attempt budget for this statement
    pub max_retries: u32,
    /// Bind parameters
    pub params: Option<Vec<Value>>,
    /// Route through the prepared statement registry
    pub use_prepared: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            fetch: FetchMode::One,
            max_retries: 3,
            params: None,
            use_prepared: false,
        }
    }
}

impl QueryOptions {
    /// Fetch all rows instead of one
    pub fn fetch_all(mut self) -> Self {
        self.fetch = FetchMode::All;
        self
    }

    /// Set the attempt budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Set bind parameters
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Route through the prepared statement registry
    pub fn prepared(mut self) -> Self {
        self.use_prepared = true;
        self
    }
}

struct ActiveState {
    tunnel: Option<Tunnel>,
    endpoint: Endpoint,
    session: Box<dyn Session>,
    pool: SessionPool,
    prepared: HashSet<String>,
}

/// Resilient PostgreSQL connector
pub struct DbConnector {
    config: TargetConfig,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<Option<ActiveState>>,
}

impl DbConnector {
    /// Create a connector for the given target (not yet connected)
    pub fn new(config: TargetConfig) -> Self {
        Self::with_factory(config, Arc::new(PgSessionFactory))
    }

    /// Create a connector with a custom session factory
    pub fn with_factory(config: TargetConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            config,
            factory,
            state: Mutex::new(None),
        }
    }

    /// Target configuration
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Whether the connector is activated
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Endpoint the connector currently dials, if activated
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.state.lock().await.as_ref().map(|s| s.endpoint.clone())
    }

    /// Bring up the tunnel (when configured), the primary session and the
    /// session pool. Idempotent; a second call on an active connector is a
    /// no-op. A failure at any step tears down whatever came up before it.
    pub async fn activate(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        self.activate_locked(&mut state).await
    }

    /// Close the pool, the primary session and the tunnel. Each step is
    /// guarded independently so one failure never leaks the others.
    pub async fn deactivate(&self) {
        let mut state = self.state.lock().await;
        self.teardown_locked(&mut state).await;
    }

    /// Tear everything down and bring it back up
    pub async fn reconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.reconnect_locked(&mut state).await
    }

    async fn activate_locked(&self, state: &mut Option<ActiveState>) -> Result<()> {
        let lifecycle = RetryPolicy::fixed(self.config.max_retries, self.config.retry_delay);

        let (mut tunnel, endpoint) = match &self.config.mode {
            AccessMode::Direct { host, port } => (
                None,
                Endpoint {
                    host: host.clone(),
                    port: *port,
                },
            ),
            AccessMode::Tunneled {
                pod,
                namespace,
                remote_port,
            } => {
                info!("starting port-forward for pod {pod}");
                tunnel::ensure_login(&self.config.tunnel, &lifecycle).await?;
                let t =
                    tunnel::establish(&self.config.tunnel, pod, namespace, *remote_port, &lifecycle)
                        .await?;
                let endpoint = Endpoint::local(t.local_port());
                (Some(t), endpoint)
            }
        };

        let mut session = None;
        let mut last_err = None;
        for attempt in 1..=lifecycle.max_attempts {
            if let Some(t) = tunnel.as_mut() {
                if !t.is_alive() {
                    last_err = Some(Error::connection("port-forward process is not running"));
                    break;
                }
            }
            info!(
                "attempt {}/{}: connecting to {}:{}",
                attempt, lifecycle.max_attempts, endpoint.host, endpoint.port
            );
            match self.factory.connect(&endpoint, &self.config).await {
                Ok(s) => {
                    session = Some(s);
                    break;
                }
                Err(e) => {
                    warn!("connection attempt {attempt} failed: {e}");
                    last_err = Some(e);
                    if attempt < lifecycle.max_attempts {
                        tokio::time::sleep(lifecycle.delay_for(attempt)).await;
                    }
                }
            }
        }

        let Some(session) = session else {
            if let Some(mut t) = tunnel {
                if let Err(e) = t.terminate().await {
                    warn!("failed to terminate tunnel: {e}");
                }
            }
            return Err(last_err.unwrap_or_else(|| Error::connection("connection never attempted")));
        };

        let pool = match SessionPool::new(
            Arc::clone(&self.factory),
            endpoint.clone(),
            self.config.clone(),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                let mut session = session;
                session.close().await;
                if let Some(mut t) = tunnel {
                    if let Err(e) = t.terminate().await {
                        warn!("failed to terminate tunnel: {e}");
                    }
                }
                return Err(e);
            }
        };

        *state = Some(ActiveState {
            tunnel,
            endpoint,
            session,
            pool,
            prepared: HashSet::new(),
        });
        Ok(())
    }

    async fn teardown_locked(&self, state: &mut Option<ActiveState>) {
        let Some(mut active) = state.take() else {
            return;
        };
        active.pool.close().await;
        active.session.close().await;
        if let Some(mut t) = active.tunnel {
            if let Err(e) = t.terminate().await {
                warn!("failed to terminate tunnel: {e}");
            } else {
                info!("port-forward terminated");
            }
        }
    }

    async fn reconnect_locked(&self, state: &mut Option<ActiveState>) -> Result<()> {
        info!("reconnecting tunnel and database session");
        self.teardown_locked(state).await;
        self.activate_locked(state).await?;
        info!("reconnected");
        Ok(())
    }

    async fn ensure_active_locked(&self, state: &mut Option<ActiveState>) -> Result<()> {
        match state {
            None => self.activate_locked(state).await,
            Some(active) if active.session.is_closed() => {
                warn!("database session is closed, reconnecting");
                self.reconnect_locked(state).await
            }
            Some(_) => Ok(()),
        }
    }

    /// Execute a statement on the primary session.
    ///
    /// Writes (INSERT/UPDATE/DELETE) and statements without a result set
    /// return [`QueryOutput::None`]; row-returning statements are shaped by
    /// the requested fetch mode. Large parameterized inserts whose parameters
    /// are full rows are redirected to [`DbConnector::batch_insert`].
    pub async fn run_query(&self, query: &str, opts: QueryOptions) -> Result<QueryOutput> {
        let mut state = self.state.lock().await;
        self.ensure_active_locked(&mut state).await?;

        let sql = escape_single_quotes(query);
        let kind = QueryKind::of(&sql);

        // Bulk redirect: a plain multi-row insert with one Array per row
        if kind == QueryKind::Insert && sql.to_ascii_lowercase().contains("values") {
            if let Some(params) = opts.params.as_ref() {
                if params.len() > BULK_REDIRECT_THRESHOLD
                    && params.iter().all(|p| p.as_row().is_some())
                {
                    match parse_insert(&sql) {
                        Some((table, columns)) => {
                            info!(
                                "converting to batch insert: {} with {} rows",
                                table,
                                params.len()
                            );
                            let rows: Vec<Vec<Value>> = params
                                .iter()
                                .map(|p| p.as_row().unwrap_or_default().to_vec())
                                .collect();
                            self.batch_insert_locked(
                                &mut state,
                                &table,
                                &columns,
                                &rows,
                                DEFAULT_BATCH_SIZE,
                            )
                            .await?;
                            return Ok(QueryOutput::None);
                        }
                        None => {
                            warn!("could not convert to batch insert, using standard execution");
                        }
                    }
                }
            }
        }

        if opts.use_prepared {
            if let Some(params) = opts.params.clone() {
                return self
                    .run_prepared_locked(&mut state, &sql, &params, opts.fetch)
                    .await;
            }
        }

        let params = opts.params.unwrap_or_default();
        let max_retries = opts.max_retries.max(1);
        let started = Instant::now();

        for attempt in 1..=max_retries {
            if state.is_none() {
                self.activate_locked(&mut state).await?;
            }
            let active = state
                .as_mut()
                .ok_or_else(|| Error::connection("connector is not active"))?;

            let outcome = if kind.returns_rows() {
                active
                    .session
                    .query(&sql, &params)
                    .await
                    .map(QueryOutcome::Rows)
            } else {
                active
                    .session
                    .execute(&sql, &params)
                    .await
                    .map(QueryOutcome::Affected)
            };

            match outcome {
                Ok(result) => {
                    let elapsed = started.elapsed();
                    if elapsed > SLOW_QUERY {
                        error!(
                            "slow query detected ({:.2}s): {}",
                            elapsed.as_secs_f64(),
                            truncate_sql(&sql, SQL_PREVIEW)
                        );
                        if kind == QueryKind::Insert {
                            warn!("consider batch_insert for repeated inserts");
                        }
                    }
                    return Ok(match result {
                        QueryOutcome::Affected(_) => QueryOutput::None,
                        QueryOutcome::Rows(rows) => shape_rows(rows, opts.fetch),
                    });
                }
                Err(e) if e.is_retriable() && attempt < max_retries => {
                    if let Some(active) = state.as_mut() {
                        let _ = active.session.execute("ROLLBACK", &[]).await;
                    }
                    warn!("attempt {attempt}/{max_retries} failed: {e}");
                    tokio::time::sleep(RetryPolicy::exponential(max_retries).delay_for(attempt))
                        .await;
                    if e.needs_reconnect() {
                        self.reconnect_locked(&mut state).await?;
                    }
                }
                Err(e) if e.is_retriable() => {
                    warn!("attempt {attempt}/{max_retries} failed: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        error!("failed to execute statement after {max_retries} attempts");
        Err(Error::QueryExhausted {
            attempts: max_retries,
            sql: truncate_sql(&sql, SQL_PREVIEW),
        })
    }

    async fn run_prepared_locked(
        &self,
        state: &mut Option<ActiveState>,
        sql: &str,
        params: &[Value],
        fetch: FetchMode,
    ) -> Result<QueryOutput> {
        let active = state
            .as_mut()
            .ok_or_else(|| Error::connection("connector is not active"))?;
        let name = format!("stmt_{:016x}", statement_key(sql));
        let kind = QueryKind::of(sql);

        if !active.prepared.contains(&name) {
            active.session.prepare(&name, sql).await?;
            active.prepared.insert(name.clone());
        }

        let started = Instant::now();
        let result = if kind.returns_rows() {
            active
                .session
                .query_prepared(&name, params)
                .await
                .map(|rows| shape_rows(rows, fetch))
        } else {
            active
                .session
                .execute_prepared(&name, params)
                .await
                .map(|_| QueryOutput::None)
        };

        match result {
            Ok(output) => {
                let elapsed = started.elapsed();
                if elapsed > SLOW_QUERY {
                    error!(
                        "slow prepared statement ({:.2}s): {name}",
                        elapsed.as_secs_f64()
                    );
                }
                Ok(output)
            }
            Err(e) => {
                // A failed statement may be poisoned server-side; drop it from
                // the registry so the next call re-prepares.
                active.prepared.remove(&name);
                let _ = active.session.execute("ROLLBACK", &[]).await;
                error!("prepared statement {name} failed: {e}");
                Err(e)
            }
        }
    }

    /// Insert `rows` into `table` in chunks of `batch_size`, committing per
    /// chunk. A failure on chunk `k` leaves chunks `1..k` committed and maps
    /// to [`Error::BatchInsert`] carrying the committed row count.
    pub async fn batch_insert(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
        batch_size: usize,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_active_locked(&mut state).await?;
        self.batch_insert_locked(&mut state, table, columns, rows, batch_size)
            .await
    }

    async fn batch_insert_locked(
        &self,
        state: &mut Option<ActiveState>,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
        batch_size: usize,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        if columns.is_empty() || rows.iter().any(|r| r.len() != columns.len()) {
            return Err(Error::query(format!(
                "batch insert into {table}: row width does not match {} columns",
                columns.len()
            )));
        }
        let batch_size = batch_size.max(1);
        let active = state
            .as_mut()
            .ok_or_else(|| Error::connection("connector is not active"))?;

        let mut rows_committed = 0;
        for (idx, chunk) in rows.chunks(batch_size).enumerate() {
            let sql = build_multi_insert(table, columns, chunk.len());
            let params: Vec<Value> = chunk.iter().flatten().cloned().collect();
            if let Err(e) = active.session.execute(&sql, &params).await {
                let _ = active.session.execute("ROLLBACK", &[]).await;
                error!("batch insert failed: {e}");
                return Err(Error::BatchInsert {
                    chunk: idx + 1,
                    rows_committed,
                    message: e.to_string(),
                });
            }
            rows_committed += chunk.len();
        }

        info!("batch inserted {} records into {}", rows.len(), table);
        Ok(())
    }

    /// Borrow an extra session from the pool, activating the connector first
    /// if needed. The session returns to the pool when the guard drops.
    pub async fn get_connection(&self) -> Result<PooledSession> {
        let pool = {
            let mut state = self.state.lock().await;
            self.ensure_active_locked(&mut state).await?;
            state
                .as_ref()
                .map(|active| active.pool.clone())
                .ok_or_else(|| Error::connection("connector is not active"))?
        };
        pool.acquire().await
    }

    /// Run `body` inside a transaction on the primary session: commits when
    /// the closure returns `Ok`, rolls back (and logs) when it returns `Err`.
    /// Statements issued through the connector inside the closure join the
    /// open transaction.
    pub async fn transaction<'a, T, F>(&'a self, body: F) -> Result<T>
    where
        F: FnOnce(&'a DbConnector) -> BoxFuture<'a, Result<T>>,
    {
        self.control("BEGIN").await?;
        if let Err(e) = self
            .control("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .await
        {
            // do not leave the opened transaction dangling on the session
            if let Err(rb) = self.control("ROLLBACK").await {
                warn!("rollback failed: {rb}");
            }
            return Err(e);
        }

        match body(self).await {
            Ok(value) => {
                self.control("COMMIT").await?;
                Ok(value)
            }
            Err(e) => {
                error!("transaction failed: {e}");
                if let Err(rb) = self.control("ROLLBACK").await {
                    warn!("rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    async fn control(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_active_locked(&mut state).await?;
        let active = state
            .as_mut()
            .ok_or_else(|| Error::connection("connector is not active"))?;
        active.session.execute(sql, &[]).await.map_err(|e| Error::Transaction {
            message: format!("{sql} failed"),
            source: Some(Box::new(e)),
        })?;
        Ok(())
    }

    /// Run a row-returning statement and fetch at most one row
    pub async fn fetch_one(&self, query: &str, params: Vec<Value>) -> Result<Option<Row>> {
        let opts = QueryOptions::default().with_params(params);
        Ok(self.run_query(query, opts).await?.row())
    }

    /// Run a row-returning statement and fetch all rows
    pub async fn fetch_all(&self, query: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        let opts = QueryOptions::default().fetch_all().with_params(params);
        Ok(self.run_query(query, opts).await?.rows())
    }

    /// Run a statement for its side effect
    pub async fn execute(&self, query: &str, params: Vec<Value>) -> Result<()> {
        let opts = QueryOptions::default().with_params(params);
        self.run_query(query, opts).await?;
        Ok(())
    }
}

enum QueryOutcome {
    Affected(u64),
    Rows(Vec<Row>),
}

fn shape_rows(rows: Vec<Row>, fetch: FetchMode) -> QueryOutput {
    match fetch {
        FetchMode::One => QueryOutput::Row(rows.into_iter().next()),
        FetchMode::All => QueryOutput::Rows(rows),
    }
}
