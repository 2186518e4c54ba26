//! Session pool
//!
//! A bounded pool of extra sessions for callers that need concurrency beyond
//! the connector's primary session. Semaphore-based admission with an acquire
//! timeout; sessions are returned on guard drop and dead sessions are
//! discarded instead of being reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::config::TargetConfig;
use crate::error::{Error, Result};
use crate::session::{Endpoint, Session, SessionFactory};

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    endpoint: Endpoint,
    config: TargetConfig,
    idle: Mutex<Vec<Box<dyn Session>>>,
    semaphore: Semaphore,
    closed: AtomicBool,
}

/// Bounded pool of database sessions
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool and pre-open the configured minimum number of sessions
    pub async fn new(
        factory: Arc<dyn SessionFactory>,
        endpoint: Endpoint,
        config: TargetConfig,
    ) -> Result<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                semaphore: Semaphore::new(config.pool_max),
                idle: Mutex::new(Vec::with_capacity(config.pool_max)),
                factory,
                endpoint,
                config,
                closed: AtomicBool::new(false),
            }),
        };

        let mut warm = Vec::new();
        for _ in 0..pool.inner.config.pool_min {
            let session = pool
                .inner
                .factory
                .connect(&pool.inner.endpoint, &pool.inner.config)
                .await?;
            warm.push(session);
        }
        pool.inner.idle.lock().await.extend(warm);

        debug!(
            "session pool ready ({}..{} sessions)",
            pool.inner.config.pool_min, pool.inner.config.pool_max
        );
        Ok(pool)
    }

    /// Borrow a session, opening a new one if no idle session is usable.
    /// Waits up to the configured acquire timeout for a free slot.
    pub async fn acquire(&self) -> Result<PooledSession> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is closed".to_string(),
            });
        }

        let permit = tokio::time::timeout(
            self.inner.config.pool_acquire_timeout,
            self.inner.semaphore.acquire(),
        )
        .await
        .map_err(|_| Error::PoolExhausted {
            message: format!(
                "no session available within {:?}",
                self.inner.config.pool_acquire_timeout
            ),
        })?
        .map_err(|_| Error::PoolExhausted {
            message: "pool is closed".to_string(),
        })?;

        // Reuse the most recently returned live session
        loop {
            let candidate = self.inner.idle.lock().await.pop();
            match candidate {
                Some(session) if !session.is_closed() => {
                    permit.forget();
                    return Ok(PooledSession {
                        session: Some(session),
                        pool: Arc::clone(&self.inner),
                    });
                }
                Some(_) => {
                    debug!("discarding dead pooled session");
                }
                None => break,
            }
        }

        let session = match self
            .inner
            .factory
            .connect(&self.inner.endpoint, &self.inner.config)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                drop(permit);
                return Err(e);
            }
        };
        permit.forget();
        Ok(PooledSession {
            session: Some(session),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Number of idle sessions
    pub async fn idle(&self) -> usize {
        self.inner.idle.lock().await.len()
    }

    /// Close the pool and every idle session
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.semaphore.close();
        let mut idle = self.inner.idle.lock().await;
        for mut session in idle.drain(..) {
            session.close().await;
        }
        debug!("session pool closed");
    }
}

/// A session borrowed from the pool, returned on drop
pub struct PooledSession {
    session: Option<Box<dyn Session>>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_ref()
            .expect("session already returned")
            .as_ref()
    }
}

impl std::ops::DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_mut()
            .expect("session already returned")
            .as_mut()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                if !pool.closed.load(Ordering::Acquire) && !session.is_closed() {
                    pool.idle.lock().await.push(session);
                }
                pool.semaphore.add_permits(1);
            });
        }
    }
}
