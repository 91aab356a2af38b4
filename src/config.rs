//! Server configuration

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the server
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listening socket binds to.
    pub bind: IpAddr,
    /// TCP port the listening socket binds to.
    pub port: u16,
    /// Directory static files are served from.
    pub doc_root: PathBuf,
    /// Number of worker threads draining the work queue.
    pub workers: usize,
    /// Connections accepted before new ones get the busy reply.
    pub max_clients: usize,
    /// Most entries the work queue holds before dispatch fails.
    pub max_queue: usize,
    /// Tick cadence of the idle-eviction wheel. A connection is evicted
    /// after three timeslots without activity.
    pub timeslot: Duration,
    /// Database connection settings.
    pub db: DbConfig,
}

/// Connection settings for the user database
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database server host.
    pub host: String,
    /// Database server port.
    pub port: u16,
    /// Account name.
    pub user: String,
    /// Account password.
    pub password: String,
    /// Database holding the `user` table.
    pub database: String,
    /// Handles opened at startup; also the pool capacity.
    pub connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 9999,
            doc_root: PathBuf::from("root"),
            workers: 8,
            max_clients: 65536,
            max_queue: 10000,
            timeslot: Duration::from_secs(5),
            db: DbConfig::default(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "webserver".to_string(),
            connections: 8,
        }
    }
}
