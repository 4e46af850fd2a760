//! Small SQLite connection pool with scoped acquisition
//!
//! Connections are opened lazily and handed out as `PooledConnection`
//! guards. Dropping the guard returns the connection to the idle list on
//! every exit path, including `?` early returns.

use super::error::PoolError;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Applies per-connection settings right after open
type SetupFn = dyn Fn(&Connection) -> rusqlite::Result<()> + Send + Sync;

#[derive(Clone)]
pub struct SqlitePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
    setup: Box<SetupFn>,
}

impl SqlitePool {
    pub fn new(path: impl AsRef<Path>, max_idle: usize) -> Self {
        Self::with_setup(path, max_idle, |_| Ok(()))
    }

    /// Pool whose connections run `setup` once after opening
    pub fn with_setup<F>(path: impl AsRef<Path>, max_idle: usize, setup: F) -> Self
    where
        F: Fn(&Connection) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                path: path.as_ref().to_path_buf(),
                idle: Mutex::new(Vec::with_capacity(max_idle)),
                max_idle: max_idle.max(1),
                setup: Box::new(setup),
            }),
        }
    }

    /// Take an idle connection or open a new one
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let reused = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = Connection::open(&self.inner.path).map_err(|source| PoolError::Open {
                    path: self.inner.path.display().to_string(),
                    source,
                })?;
                (self.inner.setup)(&conn)?;
                log::debug!("🔌 Opened SQLite connection: {}", self.inner.path.display());
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Drop the connection instead of returning it (e.g. after an I/O error)
    pub fn discard(mut self) {
        self.conn.take();
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self
                .pool
                .idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if idle.len() < self.pool.max_idle {
                idle.push(conn);
            }
        }
    }
}
