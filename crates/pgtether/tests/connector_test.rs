//! Tests for the pgtether connector against a scripted session

use async_trait::async_trait;
use pgtether::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ==================== Scripted session ====================

#[derive(Default)]
struct Shared {
    /// Every statement run through query/execute, in order
    executed: Mutex<Vec<String>>,
    /// Names of statements prepared
    prepared: Mutex<Vec<String>>,
    /// Scripted outcomes per statement prefix; `None` entries succeed
    failures: Mutex<HashMap<String, VecDeque<Option<Error>>>>,
    /// Canned result sets per exact statement text
    results: Mutex<HashMap<String, Vec<Row>>>,
    connects: AtomicU32,
    closes: AtomicU32,
}

impl Shared {
    fn fail_with(&self, prefix: &str, errors: Vec<Option<Error>>) {
        self.failures
            .lock()
            .unwrap()
            .insert(prefix.to_string(), errors.into_iter().collect());
    }

    fn serve(&self, sql: &str, rows: Vec<Row>) {
        self.results.lock().unwrap().insert(sql.to_string(), rows);
    }

    fn next_outcome(&self, sql: &str) -> Option<Error> {
        let mut failures = self.failures.lock().unwrap();
        for (prefix, queue) in failures.iter_mut() {
            if sql.starts_with(prefix.as_str()) {
                if let Some(slot) = queue.pop_front() {
                    return slot;
                }
            }
        }
        None
    }

    fn count_executed(&self, prefix: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }
}

struct MockSession {
    shared: Arc<Shared>,
}

#[async_trait]
impl Session for MockSession {
    async fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.shared.executed.lock().unwrap().push(sql.to_string());
        if let Some(e) = self.shared.next_outcome(sql) {
            return Err(e);
        }
        Ok(self
            .shared
            .results
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.shared.executed.lock().unwrap().push(sql.to_string());
        match self.shared.next_outcome(sql) {
            Some(e) => Err(e),
            None => Ok(1),
        }
    }

    async fn prepare(&mut self, name: &str, sql: &str) -> Result<()> {
        if let Some(e) = self.shared.next_outcome(sql) {
            return Err(e);
        }
        self.shared.prepared.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn query_prepared(&mut self, name: &str, _params: &[Value]) -> Result<Vec<Row>> {
        let key = format!("EXECUTE {name}");
        self.shared.executed.lock().unwrap().push(key.clone());
        if let Some(e) = self.shared.next_outcome(&key) {
            return Err(e);
        }
        Ok(self
            .shared
            .results
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn execute_prepared(&mut self, name: &str, _params: &[Value]) -> Result<u64> {
        let key = format!("EXECUTE {name}");
        self.shared.executed.lock().unwrap().push(key.clone());
        match self.shared.next_outcome(&key) {
            Some(e) => Err(e),
            None => Ok(1),
        }
    }

    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockFactory {
    shared: Arc<Shared>,
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn connect(
        &self,
        _endpoint: &Endpoint,
        _config: &TargetConfig,
    ) -> Result<Box<dyn Session>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            shared: Arc::clone(&self.shared),
        }))
    }
}

fn direct_config() -> TargetConfig {
    TargetConfig::new(
        AccessMode::Direct {
            host: "localhost".into(),
            port: 5432,
        },
        "testdb",
        "tester",
        "secret",
    )
    .with_pool_size(0, 2)
    .with_max_retries(2)
    .with_retry_delay(Duration::from_millis(5))
    .with_pool_acquire_timeout(Duration::from_millis(100))
}

fn connector() -> (DbConnector, Arc<Shared>) {
    let shared = Arc::new(Shared::default());
    let factory = Arc::new(MockFactory {
        shared: Arc::clone(&shared),
    });
    (
        DbConnector::with_factory(direct_config(), factory),
        shared,
    )
}

fn row(n: i64) -> Row {
    Row::new(vec!["n".into()], vec![Value::Int64(n)])
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_activate_and_deactivate() {
    let (db, shared) = connector();

    assert!(!db.is_active().await);
    db.activate().await.unwrap();
    assert!(db.is_active().await);
    assert_eq!(shared.connects.load(Ordering::SeqCst), 1);

    // second activate is a no-op
    db.activate().await.unwrap();
    assert_eq!(shared.connects.load(Ordering::SeqCst), 1);

    db.deactivate().await;
    assert!(!db.is_active().await);
    assert_eq!(shared.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_direct_mode_endpoint() {
    let (db, _shared) = connector();
    db.activate().await.unwrap();
    assert_eq!(
        db.endpoint().await,
        Some(Endpoint {
            host: "localhost".into(),
            port: 5432,
        })
    );
}

#[tokio::test]
async fn test_reconnect_replaces_session() {
    let (db, shared) = connector();
    db.activate().await.unwrap();
    db.reconnect().await.unwrap();

    assert_eq!(shared.connects.load(Ordering::SeqCst), 2);
    assert_eq!(shared.closes.load(Ordering::SeqCst), 1);
}

// ==================== run_query ====================

#[tokio::test]
async fn test_write_returns_none() {
    let (db, shared) = connector();

    let out = db
        .run_query(
            "UPDATE accounts SET balance = 0",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert!(out.is_none());
    assert_eq!(shared.count_executed("UPDATE accounts"), 1);
}

#[tokio::test]
async fn test_select_fetch_shapes() {
    let (db, shared) = connector();
    shared.serve("SELECT n FROM t", vec![row(1), row(2)]);

    let one = db
        .run_query("SELECT n FROM t", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(one.row(), Some(row(1)));

    let all = db
        .run_query("SELECT n FROM t", QueryOptions::default().fetch_all())
        .await
        .unwrap();
    assert_eq!(all.rows(), vec![row(1), row(2)]);

    // empty result
    let none = db
        .run_query("SELECT n FROM empty", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(none.row(), None);
}

#[tokio::test]
async fn test_repeated_select_returns_equal_results() {
    let (db, shared) = connector();
    shared.serve("SELECT n FROM t", vec![row(1), row(2)]);

    let opts = || QueryOptions::default().fetch_all();
    let first = db.run_query("SELECT n FROM t", opts()).await.unwrap();
    let second = db.run_query("SELECT n FROM t", opts()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(second.rows(), vec![row(1), row(2)]);
}

#[tokio::test]
async fn test_escapes_embedded_apostrophes() {
    let (db, shared) = connector();
    db.run_query(
        "SELECT id FROM users WHERE name = 'O'Brien'",
        QueryOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(shared.count_executed("SELECT id FROM users WHERE name = 'O''Brien'"), 1);
}

// ==================== Retry behavior ====================

#[tokio::test]
async fn test_retry_recovers_after_deadlock() {
    let (db, shared) = connector();
    shared.fail_with(
        "UPDATE accounts",
        vec![Some(Error::Deadlock), Some(Error::Deadlock), None],
    );

    let out = db
        .run_query(
            "UPDATE accounts SET balance = balance - 1",
            QueryOptions::default().with_max_retries(3),
        )
        .await
        .unwrap();

    assert!(out.is_none());
    assert_eq!(shared.count_executed("UPDATE accounts"), 3);
    // each transient failure rolls the session back
    assert_eq!(shared.count_executed("ROLLBACK"), 2);
}

#[tokio::test]
async fn test_retry_exhaustion_with_backoff() {
    let (db, shared) = connector();
    shared.fail_with(
        "UPDATE accounts",
        vec![Some(Error::Deadlock), Some(Error::Deadlock)],
    );

    let started = Instant::now();
    let err = db
        .run_query(
            "UPDATE accounts SET balance = 0",
            QueryOptions::default().with_max_retries(2),
        )
        .await
        .unwrap_err();

    match err {
        Error::QueryExhausted { attempts, sql } => {
            assert_eq!(attempts, 2);
            assert!(sql.starts_with("UPDATE accounts"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(shared.count_executed("UPDATE accounts"), 2);
    // one exponential backoff sleep between the two attempts
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_non_retriable_error_fails_fast() {
    let (db, shared) = connector();
    shared.fail_with(
        "UPDATE accounts",
        vec![Some(Error::query("syntax error at or near"))],
    );

    let err = db
        .run_query("UPDATE accounts SET", QueryOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(shared.count_executed("UPDATE accounts"), 1);
}

#[tokio::test]
async fn test_connection_failure_triggers_reconnect() {
    let (db, shared) = connector();
    db.activate().await.unwrap();
    shared.fail_with(
        "SELECT n FROM t",
        vec![Some(Error::connection("server closed the connection"))],
    );
    shared.serve("SELECT n FROM t", vec![row(7)]);

    let out = db
        .run_query("SELECT n FROM t", QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(out.row(), Some(row(7)));
    // initial activate plus one reconnect
    assert_eq!(shared.connects.load(Ordering::SeqCst), 2);
}

// ==================== Prepared statements ====================

#[tokio::test]
async fn test_prepared_statement_reuse() {
    let (db, shared) = connector();
    let opts = || {
        QueryOptions::default()
            .prepared()
            .with_params(vec![Value::Int64(1)])
    };

    db.run_query("SELECT n FROM t WHERE id = $1", opts())
        .await
        .unwrap();
    db.run_query("SELECT n FROM t WHERE id = $1", opts())
        .await
        .unwrap();

    // prepared once, executed twice
    assert_eq!(shared.prepared.lock().unwrap().len(), 1);
    assert_eq!(shared.count_executed("EXECUTE stmt_"), 2);
}

#[tokio::test]
async fn test_prepared_registry_reset_on_reconnect() {
    let (db, shared) = connector();
    let opts = || {
        QueryOptions::default()
            .prepared()
            .with_params(vec![Value::Int64(1)])
    };

    db.run_query("SELECT n FROM t WHERE id = $1", opts())
        .await
        .unwrap();
    db.reconnect().await.unwrap();
    db.run_query("SELECT n FROM t WHERE id = $1", opts())
        .await
        .unwrap();

    assert_eq!(shared.prepared.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_prepared_statement_is_dropped_from_registry() {
    let (db, shared) = connector();
    let opts = || {
        QueryOptions::default()
            .prepared()
            .with_params(vec![Value::Int64(1)])
    };

    // first execution fails, second call must re-prepare
    shared.fail_with("EXECUTE stmt_", vec![Some(Error::query("bad statement"))]);

    db.run_query("SELECT n FROM t WHERE id = $1", opts())
        .await
        .unwrap_err();
    db.run_query("SELECT n FROM t WHERE id = $1", opts())
        .await
        .unwrap();

    assert_eq!(shared.prepared.lock().unwrap().len(), 2);
}

// ==================== Batch inserts ====================

fn sample_rows(n: i64) -> Vec<Vec<Value>> {
    (0..n)
        .map(|i| vec![Value::Int64(i), Value::String(format!("row-{i}"))])
        .collect()
}

#[tokio::test]
async fn test_batch_insert_chunking() {
    let (db, shared) = connector();
    let columns = vec!["id".to_string(), "name".to_string()];

    db.batch_insert("events", &columns, &sample_rows(25), 10)
        .await
        .unwrap();

    // 25 rows with batch size 10 issue ceil(25/10) = 3 statements
    assert_eq!(shared.count_executed("INSERT INTO events"), 3);
}

#[tokio::test]
async fn test_batch_insert_failure_reports_committed_rows() {
    let (db, shared) = connector();
    let columns = vec!["id".to_string(), "name".to_string()];
    shared.fail_with(
        "INSERT INTO events",
        vec![None, Some(Error::query("duplicate key"))],
    );

    let err = db
        .batch_insert("events", &columns, &sample_rows(25), 10)
        .await
        .unwrap_err();

    match err {
        Error::BatchInsert {
            chunk,
            rows_committed,
            ..
        } => {
            assert_eq!(chunk, 2);
            assert_eq!(rows_committed, 10);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_batch_insert_rejects_ragged_rows() {
    let (db, _shared) = connector();
    let columns = vec!["id".to_string(), "name".to_string()];
    let rows = vec![vec![Value::Int64(1)]];

    let err = db.batch_insert("events", &columns, &rows, 10).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Query);
}

#[tokio::test]
async fn test_bulk_redirect_for_large_parameterized_insert() {
    let (db, shared) = connector();
    let params: Vec<Value> = (0..12)
        .map(|i| Value::Array(vec![Value::Int64(i), Value::String(format!("m{i}"))]))
        .collect();

    let out = db
        .run_query(
            "INSERT INTO metrics (name, value) VALUES ($1, $2)",
            QueryOptions::default().with_params(params),
        )
        .await
        .unwrap();

    assert!(out.is_none());
    let executed = shared.executed.lock().unwrap();
    let stmt = executed
        .iter()
        .find(|s| s.starts_with("INSERT INTO metrics"))
        .unwrap();
    // all 12 rows land in one multi-row statement
    assert!(stmt.contains("($23, $24)"));
}

#[tokio::test]
async fn test_bulk_redirect_falls_back_when_unparsable() {
    let (db, shared) = connector();
    let params: Vec<Value> = (0..12)
        .map(|i| Value::Array(vec![Value::Int64(i)]))
        .collect();

    // no column list, the insert parser cannot split it
    db.run_query(
        "INSERT INTO metrics VALUES ($1)",
        QueryOptions::default().with_params(params),
    )
    .await
    .unwrap();

    assert_eq!(shared.count_executed("INSERT INTO metrics VALUES ($1)"), 1);
}

// ==================== Transactions ====================

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let (db, shared) = connector();

    let out = db
        .transaction(|db| {
            Box::pin(async move {
                db.execute("UPDATE t SET x = 1", vec![]).await?;
                Ok(7)
            })
        })
        .await
        .unwrap();

    assert_eq!(out, 7);
    assert_eq!(shared.count_executed("BEGIN"), 1);
    assert_eq!(shared.count_executed("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"), 1);
    assert_eq!(shared.count_executed("COMMIT"), 1);
    assert_eq!(shared.count_executed("ROLLBACK"), 0);
}

#[tokio::test]
async fn test_transaction_rolls_back_on_error() {
    let (db, shared) = connector();

    let err = db
        .transaction::<(), _>(|db| {
            Box::pin(async move {
                db.execute("UPDATE t SET x = 1", vec![]).await?;
                Err(Error::query("validation failed"))
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(shared.count_executed("ROLLBACK"), 1);
    assert_eq!(shared.count_executed("COMMIT"), 0);
}

#[tokio::test]
async fn test_transaction_rolls_back_when_isolation_setup_fails() {
    let (db, shared) = connector();
    shared.fail_with(
        "SET TRANSACTION",
        vec![Some(Error::query("cannot set isolation level"))],
    );

    let err = db
        .transaction::<(), _>(|db| {
            Box::pin(async move {
                db.execute("UPDATE t SET x = 1", vec![]).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Transaction);
    // the opened transaction is not left dangling, and the body never ran
    assert_eq!(shared.count_executed("ROLLBACK"), 1);
    assert_eq!(shared.count_executed("UPDATE t"), 0);
    assert_eq!(shared.count_executed("COMMIT"), 0);
}

// ==================== Pool ====================

#[tokio::test]
async fn test_pool_bounds_concurrent_sessions() {
    let (db, _shared) = connector();

    let first = db.get_connection().await.unwrap();
    let second = db.get_connection().await.unwrap();

    // pool max is 2; a third acquisition times out
    let err = db.get_connection().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Pool);

    drop(first);
    drop(second);
}

#[tokio::test]
async fn test_pooled_session_usable() {
    let (db, shared) = connector();
    let mut session = db.get_connection().await.unwrap();

    session.execute("DELETE FROM staging", &[]).await.unwrap();
    assert_eq!(shared.count_executed("DELETE FROM staging"), 1);
}
