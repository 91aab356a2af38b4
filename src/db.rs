//! The user database
//!
//! Three pieces: the [`UserStore`] seam the rest of the server is generic
//! over, the bounded [`Pool`] handing stores out with scoped
//! borrow-and-return, and the [`UserTable`] credential cache loaded once at
//! startup. The MySQL driver only ever appears behind [`MySqlStore`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use mysql::prelude::Queryable;

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::sync::Semaphore;

/// Access to the `user(name, password)` table.
pub trait UserStore: Send {
    /// Fetches every stored (name, password) row.
    fn load_users(&mut self) -> Result<Vec<(String, String)>>;

    /// Persists a newly registered user.
    fn insert_user(&mut self, name: &str, password: &str) -> Result<()>;
}

/// [`UserStore`] over a live MySQL connection.
pub struct MySqlStore {
    conn: mysql::Conn,
}

impl MySqlStore {
    /// Opens one connection to the configured server.
    pub fn connect(config: &DbConfig) -> Result<Self> {
        let opts = mysql::OptsBuilder::new()
            .ip_or_hostname(Some(config.host.as_str()))
            .tcp_port(config.port)
            .user(Some(config.user.as_str()))
            .pass(Some(config.password.as_str()))
            .db_name(Some(config.database.as_str()));

        Ok(Self {
            conn: mysql::Conn::new(opts)?,
        })
    }
}

impl UserStore for MySqlStore {
    fn load_users(&mut self) -> Result<Vec<(String, String)>> {
        Ok(self.conn.query("SELECT username, password FROM user")?)
    }

    fn insert_user(&mut self, name: &str, password: &str) -> Result<()> {
        self.conn.exec_drop(
            "INSERT INTO user(name, password) VALUES (?, ?)",
            (name, password),
        )?;
        Ok(())
    }
}

impl fmt::Debug for MySqlStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlStore").finish_non_exhaustive()
    }
}

/// In-memory [`UserStore`] for the test suite and database-less runs.
///
/// Clones share one underlying table, the way separate MySQL connections
/// reach the same database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `rows`.
    pub fn with_users(rows: Vec<(String, String)>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(rows)),
        }
    }

    /// Snapshot of the stored rows.
    pub fn rows(&self) -> Vec<(String, String)> {
        self.rows.lock().unwrap().clone()
    }
}

impl UserStore for MemoryStore {
    fn load_users(&mut self) -> Result<Vec<(String, String)>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .push((name.to_string(), password.to_string()));
        Ok(())
    }
}

/// Username → password cache, read on every login and written on every
/// successful registration.
#[derive(Debug, Default)]
pub struct UserTable {
    users: Mutex<HashMap<String, String>>,
}

impl UserTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from the rows loaded at startup.
    pub fn from_rows(rows: Vec<(String, String)>) -> Self {
        Self {
            users: Mutex::new(rows.into_iter().collect()),
        }
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.users.lock().unwrap().contains_key(name)
    }

    /// Whether `name` is registered with exactly `password`.
    pub fn verify(&self, name: &str, password: &str) -> bool {
        self.users.lock().unwrap().get(name).map(String::as_str) == Some(password)
    }

    /// Records a newly registered user.
    pub fn insert(&self, name: String, password: String) {
        self.users.lock().unwrap().insert(name, password);
    }

    /// Number of registered users.
    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    /// Whether no user is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct PoolInner<S> {
    free_list: VecDeque<S>,
    free: usize,
    in_use: usize,
}

/// Fixed-size pool of database stores.
///
/// `free + in_use == capacity` whenever no thread is mid-acquire, and the
/// semaphore count equals `free`. Exhaustion blocks the acquiring worker
/// until another returns its store.
pub struct Pool<S> {
    inner: Mutex<PoolInner<S>>,
    slots: Semaphore,
    capacity: usize,
}

impl<S: UserStore> Pool<S> {
    /// Builds a pool over pre-established stores.
    pub fn new(stores: Vec<S>) -> Result<Self> {
        if stores.is_empty() {
            return Err(Error::EmptyPool);
        }

        let capacity = stores.len();
        Ok(Self {
            inner: Mutex::new(PoolInner {
                free: capacity,
                in_use: 0,
                free_list: stores.into(),
            }),
            slots: Semaphore::new(capacity),
            capacity,
        })
    }

    /// Borrows a store, blocking while all are out. The returned guard
    /// gives it back when it goes out of scope, on every exit path.
    pub fn acquire(&self) -> PooledStore<'_, S> {
        self.slots.acquire();

        let mut inner = self.inner.lock().unwrap();
        let store = inner
            .free_list
            .pop_front()
            .expect("semaphore holds one permit per free store");
        inner.free -= 1;
        inner.in_use += 1;

        PooledStore {
            pool: self,
            store: Some(store),
        }
    }

    fn release(&self, store: S) {
        let mut inner = self.inner.lock().unwrap();
        inner.free_list.push_back(store);
        inner.free += 1;
        inner.in_use -= 1;
        drop(inner);

        self.slots.release();
    }

    /// Number of stores the pool was built with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current (free, in-use) counts. Only meaningful when no thread is
    /// mid-acquire.
    pub fn counters(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.free, inner.in_use)
    }
}

impl<S> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("free", &inner.free)
            .field("in_use", &inner.in_use)
            .finish()
    }
}

/// Scoped borrow of one pool store.
pub struct PooledStore<'a, S: UserStore> {
    pool: &'a Pool<S>,
    store: Option<S>,
}

impl<S: UserStore> Deref for PooledStore<'_, S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref().expect("store held until drop")
    }
}

impl<S: UserStore> DerefMut for PooledStore<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store.as_mut().expect("store held until drop")
    }
}

impl<S: UserStore> Drop for PooledStore<'_, S> {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            self.pool.release(store);
        }
    }
}

impl<S: UserStore> fmt::Debug for PooledStore<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStore").finish_non_exhaustive()
    }
}
