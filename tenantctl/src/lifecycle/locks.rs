//! Per-tag operation locks.
//!
//! Every lifecycle method holds the lock of the tag it touches for its whole duration, external
//! job included. Interactive callers use [`TagLocks::try_acquire`] and get a conflict instead of
//! queueing behind a job that may run for minutes; the background worker waits with
//! [`TagLocks::acquire`].
//!
//! Within one process a tag is guarded by a mutex, and map entries are dropped once nobody holds
//! or waits on them. With a database pool attached ([`TagLocks::with_postgres`]) the guard also
//! holds a session-level advisory lock keyed on the tag, so the daemon and one-shot CLI
//! invocations exclude each other. Advisory locks are bound to a session, so the guard keeps a
//! dedicated connection for as long as it lives; if that connection dies the lock goes with it.

use dashmap::DashMap;
use sqlx::{PgPool, Postgres, pool::PoolConnection};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::db::errors::DbError;
use crate::errors::{Error, Result};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// First key of every tag lock; the second is `hashtext(tag)`
const ADVISORY_NAMESPACE: i32 = 0x7465_6e74;

#[derive(Clone, Default)]
pub struct TagLocks {
    locks: Arc<LockMap>,
    pool: Option<PgPool>,
}

/// Held while an operation on a tag is in progress
pub struct TagGuard {
    guard: Option<OwnedMutexGuard<()>>,
    session: Option<PoolConnection<Postgres>>,
    tag: String,
    locks: Arc<LockMap>,
}

impl Drop for TagGuard {
    fn drop(&mut self) {
        let guard = self.guard.take();
        let Some(session) = self.session.take() else {
            drop(guard);
            forget_idle(&self.locks, &self.tag);
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let tag = self.tag.clone();
                let locks = self.locks.clone();
                handle.spawn(async move {
                    release_session(session, &tag).await;
                    // Only now may the next local holder ask for the advisory lock.
                    drop(guard);
                    forget_idle(&locks, &tag);
                });
            }
            Err(_) => {
                // Closing the session releases its advisory locks.
                drop(session.detach());
                drop(guard);
                forget_idle(&self.locks, &self.tag);
            }
        }
    }
}

/// The map's own reference is the only one left when nobody else wants this tag.
fn forget_idle(locks: &LockMap, tag: &str) {
    locks.remove_if(tag, |_, mutex| Arc::strong_count(mutex) == 1);
}

fn busy(tag: &str) -> Error {
    Error::conflict(format!(
        "Another operation on site '{tag}' is in progress. Try again once it has finished."
    ))
}

/// Take the advisory lock for `tag` on a dedicated connection. Without `wait`, returns `None`
/// when another session holds it.
async fn lock_session(pool: &PgPool, tag: &str, wait: bool) -> Result<Option<PoolConnection<Postgres>>> {
    let mut conn = pool.acquire().await.map_err(DbError::from)?;

    let taken = if wait {
        sqlx::query("SELECT pg_advisory_lock($1, hashtext($2))")
            .bind(ADVISORY_NAMESPACE)
            .bind(tag)
            .execute(&mut *conn)
            .await
            .map_err(DbError::from)?;
        true
    } else {
        sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1, hashtext($2))")
            .bind(ADVISORY_NAMESPACE)
            .bind(tag)
            .fetch_one(&mut *conn)
            .await
            .map_err(DbError::from)?
    };

    if taken {
        debug!(tag, "Advisory lock taken");
        Ok(Some(conn))
    } else {
        Ok(None)
    }
}

async fn release_session(mut session: PoolConnection<Postgres>, tag: &str) {
    let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1, hashtext($2))")
        .bind(ADVISORY_NAMESPACE)
        .bind(tag)
        .fetch_one(&mut *session)
        .await;

    match released {
        Ok(true) => debug!(tag, "Advisory lock released"),
        Ok(false) => warn!(tag, "Advisory lock was no longer held at release"),
        Err(e) => {
            warn!(tag, error = %e, "Failed to release advisory lock; closing its connection");
            drop(session.detach());
        }
    }
}

impl TagLocks {
    /// Locks scoped to this process
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks shared by every process connected to the same database
    pub fn with_postgres(pool: PgPool) -> Self {
        Self {
            locks: Arc::default(),
            pool: Some(pool),
        }
    }

    fn mutex(&self, tag: &str) -> Arc<Mutex<()>> {
        self.locks.entry(tag.to_string()).or_default().clone()
    }

    fn hold(&self, tag: &str, guard: OwnedMutexGuard<()>) -> TagGuard {
        TagGuard {
            guard: Some(guard),
            session: None,
            tag: tag.to_string(),
            locks: self.locks.clone(),
        }
    }

    /// Wait for the tag to become free
    pub async fn acquire(&self, tag: &str) -> Result<TagGuard> {
        let mut held = self.hold(tag, self.mutex(tag).lock_owned().await);
        if let Some(pool) = &self.pool {
            held.session = lock_session(pool, tag, true).await?;
        }
        Ok(held)
    }

    /// Take the tag or fail with a conflict if another operation holds it
    pub async fn try_acquire(&self, tag: &str) -> Result<TagGuard> {
        let guard = self.mutex(tag).try_lock_owned().map_err(|_| busy(tag))?;
        let mut held = self.hold(tag, guard);
        if let Some(pool) = &self.pool {
            held.session = Some(lock_session(pool, tag, false).await?.ok_or_else(|| busy(tag))?);
        }
        Ok(held)
    }

    /// True if an operation on `tag` is in progress, here or in another process
    pub async fn is_locked(&self, tag: &str) -> Result<bool> {
        match self.try_acquire(tag).await {
            Ok(_) => Ok(false),
            Err(Error::Conflict { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Number of tags currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
