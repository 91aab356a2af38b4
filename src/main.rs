//! brisk server binary

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use brisk::config::{Config, DbConfig};
use brisk::db::{MySqlStore, Pool, UserStore, UserTable};
use brisk::listener::Server;

/// Small HTTP/1.1 server for high concurrent connection counts.
#[derive(Debug, Parser)]
#[command(name = "brisk", version, about)]
struct Cli {
    /// TCP port to bind.
    port: u16,
    /// Document root served for static targets.
    #[arg(long, default_value = "root")]
    root: PathBuf,
    /// Worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
    /// Connections accepted before new ones get the busy reply.
    #[arg(long, default_value_t = 65536)]
    max_clients: usize,
    /// Idle-eviction timeslot, in seconds.
    #[arg(long, default_value_t = 5)]
    timeslot: u64,
    /// Database server host.
    #[arg(long, default_value = "localhost")]
    sql_host: String,
    /// Database server port.
    #[arg(long, default_value_t = 3306)]
    sql_port: u16,
    /// Database account.
    #[arg(long, default_value = "root")]
    sql_user: String,
    /// Database password.
    #[arg(long, default_value = "")]
    sql_password: String,
    /// Database holding the `user` table.
    #[arg(long, default_value = "webserver")]
    sql_database: String,
    /// Database handles opened at startup.
    #[arg(long, default_value_t = 8)]
    sql_conns: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!(error = %err, "startup failed");
        process::exit(-1);
    }
}

fn run(cli: Cli) -> brisk::Result<()> {
    let config = Config {
        port: cli.port,
        doc_root: cli.root,
        workers: cli.threads,
        max_clients: cli.max_clients,
        timeslot: Duration::from_secs(cli.timeslot),
        db: DbConfig {
            host: cli.sql_host,
            port: cli.sql_port,
            user: cli.sql_user,
            password: cli.sql_password,
            database: cli.sql_database,
            connections: cli.sql_conns,
        },
        ..Config::default()
    };

    let mut stores = Vec::with_capacity(config.db.connections);
    for _ in 0..config.db.connections {
        stores.push(MySqlStore::connect(&config.db)?);
    }

    // The credential cache is read once, before any request is served.
    let rows = match stores.first_mut() {
        Some(store) => store.load_users()?,
        None => Vec::new(),
    };
    info!(users = rows.len(), "loaded user table");
    let users = UserTable::from_rows(rows);

    let mut server = Server::new(config, Pool::new(stores)?, users)?;
    server.run()
}
