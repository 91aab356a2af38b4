//! Workers run the request pipeline: parsing, routing, and response
//! preparation for connections the reactor found readable.
//!
//! Each worker blocks on the shared work queue, takes exclusive hold of the
//! delivered connection, borrows a database store for the duration of one
//! `process` call, and hands the connection back to the reactor over the
//! completion channel. Workers never touch the poll registry; re-arming is
//! the reactor's job alone.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use mio::{Token, Waker};
use tracing::{debug, error};

use crate::connection::HttpConnection;
use crate::db::{Pool, UserStore};
use crate::handler::Responder;

/// A fixed count of worker threads over one work queue.
#[derive(Debug)]
pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers. Fails if any thread cannot be created.
    pub fn spawn<S: UserStore + 'static>(
        count: usize,
        work: Receiver<Arc<Mutex<HttpConnection>>>,
        done: Sender<Token>,
        waker: Arc<Waker>,
        stores: Arc<Pool<S>>,
        responder: Arc<Responder>,
    ) -> io::Result<Self> {
        let mut threads = Vec::with_capacity(count);
        for id in 0..count {
            let work = work.clone();
            let done = done.clone();
            let waker = waker.clone();
            let stores = stores.clone();
            let responder = responder.clone();

            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || run(work, done, waker, stores, responder))?;
            threads.push(handle);
        }

        Ok(Self { threads })
    }

    /// Waits for every worker to observe the queue disconnect and exit.
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("worker exited by panic");
            }
        }
    }
}

/// Worker main loop. A recv error means the reactor dropped the queue and
/// the server is shutting down.
fn run<S: UserStore>(
    work: Receiver<Arc<Mutex<HttpConnection>>>,
    done: Sender<Token>,
    waker: Arc<Waker>,
    stores: Arc<Pool<S>>,
    responder: Arc<Responder>,
) {
    while let Ok(conn) = work.recv() {
        let token = {
            let mut locked = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let mut store = stores.acquire();
            locked.process(&responder, &mut *store);
            locked.token()
        };

        // Hand the connection back for re-arming. Failure here also means
        // shutdown is underway.
        if done.send(token).is_err() || waker.wake().is_err() {
            return;
        }
    }

    debug!("work queue closed, worker exiting");
}
