//! The reactor
//!
//! One thread owns the poll handle and everything registered with it: the
//! listening socket, the signal source, the wake channel, and every
//! connection socket. Read-ready connections are deregistered and handed to
//! a worker, so exactly one component drives a connection at any moment;
//! the worker gives it back through the completion channel and the reactor
//! alone re-arms it. Write readiness is driven here directly, as is the
//! timer wheel that reclaims idle connections.

use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use signal_hook::consts::{SIGALRM, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connection::{HttpConnection, Want};
use crate::db::{Pool, UserStore, UserTable};
use crate::error::Result;
use crate::handler::Responder;
use crate::timer::{TimerHandle, TimerWheel};
use crate::worker::WorkerPool;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);
const WAKE_TOKEN: Token = Token(usize::MAX - 2);

/// Written to a just-accepted socket once the connection cap is reached.
const BUSY_REPLY: &[u8] = b"Internal Server Busy";

/// Asks a running [`Server`] to stop from another thread. The request is
/// observed at the end of the current readiness batch.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Requests a cooperative shutdown.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// The server: reactor state plus its worker pool.
pub struct Server {
    listener: TcpListener,
    poll: Poll,
    num_events: usize,
    signals: Signals,
    connections: Slab<Arc<Mutex<HttpConnection>>>,
    timers: TimerWheel,
    deadlines: HashMap<Token, TimerHandle>,
    /// Tokens currently owned by a worker (dispatched, completion pending).
    in_flight: HashSet<Token>,
    work: Option<Sender<Arc<Mutex<HttpConnection>>>>,
    done: Receiver<Token>,
    waker: Arc<Waker>,
    workers: Option<WorkerPool>,
    config: Config,
    user_count: usize,
    stop: Arc<AtomicBool>,
    tick_pending: bool,
}

impl Server {
    /// Binds the listening socket, installs the signal plumbing, and spawns
    /// the worker pool.
    pub fn new<S: UserStore + 'static>(
        config: Config,
        stores: Pool<S>,
        users: UserTable,
    ) -> Result<Self> {
        let addr = SocketAddr::new(config.bind, config.port);
        let mut listener = TcpListener::bind(addr)?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;

        let mut signals = Signals::new([SIGALRM, SIGTERM])?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        // A peer that vanishes mid-response must surface as a write error,
        // not kill the process.
        // Safety: SIG_IGN installs no handler code.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (work_tx, work_rx) = bounded(config.max_queue);
        let (done_tx, done_rx) = unbounded();

        let responder = Arc::new(Responder::new(config.doc_root.clone(), users));
        let workers = WorkerPool::spawn(
            config.workers,
            work_rx,
            done_tx,
            waker.clone(),
            Arc::new(stores),
            responder,
        )?;

        info!(addr = %listener.local_addr()?, workers = config.workers, "listening");

        Ok(Self {
            listener,
            poll,
            num_events: 1024,
            signals,
            connections: Slab::default(),
            timers: TimerWheel::new(),
            deadlines: HashMap::new(),
            in_flight: HashSet::new(),
            work: Some(work_tx),
            done: done_rx,
            waker,
            workers: Some(workers),
            config,
            user_count: 0,
            stop: Arc::new(AtomicBool::new(false)),
            tick_pending: false,
        })
    }

    /// The bound listening address. With port 0 in the config, this is how
    /// the chosen port is discovered.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle other threads can use to stop the reactor.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Runs the reactor until SIGTERM or a shutdown request. A poll failure
    /// other than an interrupt is fatal to the loop.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.num_events);
        schedule_alarm(self.config.timeslot);

        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "poll failed");
                return Err(err.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept(),
                    SIGNAL_TOKEN => self.drain_signals(),
                    WAKE_TOKEN => self.drain_completions(),
                    _ => self.connection_event(event),
                }
            }

            // Ticks are batched: expiry is checked once per wakeup, after
            // all readiness work.
            if self.tick_pending {
                self.tick();
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.user_count >= self.config.max_clients {
                        warn!(peer = %peer, "connection cap reached");
                        let _ = stream.write(BUSY_REPLY);
                        continue;
                    }

                    let entry = self.connections.vacant_entry();
                    let token = Token(entry.key());
                    let mut conn = HttpConnection::new(stream, peer, token);
                    if let Err(err) = conn.register(self.poll.registry()) {
                        warn!(peer = %peer, error = %err, "readiness registration failed");
                        continue;
                    }
                    entry.insert(Arc::new(Mutex::new(conn)));

                    let deadline = Instant::now() + 3 * self.config.timeslot;
                    let handle = self.timers.add(token, deadline);
                    self.deadlines.insert(token, handle);
                    self.user_count += 1;
                    info!(peer = %peer, active = self.user_count, "accepted connection");
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!(error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    fn drain_signals(&mut self) {
        for signal in self.signals.pending() {
            match signal {
                SIGALRM => self.tick_pending = true,
                SIGTERM => {
                    info!("received SIGTERM");
                    self.stop.store(true, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    fn drain_completions(&mut self) {
        loop {
            match self.done.try_recv() {
                Ok(token) => self.complete(token),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// A worker finished with a connection: re-arm it with whatever it
    /// asked for, or evict it.
    fn complete(&mut self, token: Token) {
        if !self.in_flight.remove(&token) {
            return;
        }
        let Some(conn) = self.connections.get(token.0).cloned() else {
            return;
        };

        let want = lock(&conn).want();
        match want {
            Want::Close => self.evict(token),
            Want::Read | Want::Write => {
                let rearmed = lock(&conn).register(self.poll.registry());
                if let Err(err) = rearmed {
                    warn!(error = %err, "re-arm failed");
                    self.evict(token);
                }
            }
        }
    }

    fn connection_event(&mut self, event: &Event) {
        let token = event.token();
        let Some(conn) = self.connections.get(token.0).cloned() else {
            return;
        };

        if event.is_error() || event.is_read_closed() {
            self.evict(token);
            return;
        }

        if event.is_readable() {
            self.read_event(token, &conn);
        } else if event.is_writable() {
            self.write_event(token, &conn);
        }
    }

    /// Drain the socket and hand the connection to a worker.
    fn read_event(&mut self, token: Token, conn: &Arc<Mutex<HttpConnection>>) {
        let mut locked = lock(conn);
        match locked.fill() {
            Ok(0) => {
                debug!(peer = %locked.peer(), "peer closed");
                drop(locked);
                self.evict(token);
            }
            Ok(bytes) => {
                debug!(peer = %locked.peer(), bytes, "drained socket");
                // Out of the readiness set while a worker owns it: no second
                // dispatch can race this one.
                if let Err(err) = locked.deregister(self.poll.registry()) {
                    warn!(error = %err, "deregister failed");
                    drop(locked);
                    self.evict(token);
                    return;
                }
                drop(locked);

                self.extend_deadline(token);
                let Some(work) = self.work.as_ref() else { return };
                if work.try_send(conn.clone()).is_err() {
                    warn!("work queue full, dropping connection");
                    self.evict(token);
                    return;
                }
                self.in_flight.insert(token);
            }
            Err(err) => {
                if err.kind() == ErrorKind::WouldBlock {
                    return;
                }
                debug!(peer = %locked.peer(), error = %err, "read failed");
                drop(locked);
                self.evict(token);
            }
        }
    }

    /// Drive the response out; the write path runs on the reactor thread.
    fn write_event(&mut self, token: Token, conn: &Arc<Mutex<HttpConnection>>) {
        let mut locked = lock(conn);
        match locked.drive_write() {
            Ok(Want::Write) => {
                drop(locked);
                self.extend_deadline(token);
            }
            Ok(Want::Read) => {
                // Response done, connection kept alive for the next request.
                let rearmed = locked.reregister(self.poll.registry());
                drop(locked);
                match rearmed {
                    Ok(()) => self.extend_deadline(token),
                    Err(_) => self.evict(token),
                }
            }
            Ok(Want::Close) => {
                drop(locked);
                self.evict(token);
            }
            Err(err) => {
                debug!(peer = %locked.peer(), error = %err, "write failed");
                drop(locked);
                self.evict(token);
            }
        }
    }

    /// Activity pushes the idle deadline another three timeslots out.
    fn extend_deadline(&mut self, token: Token) {
        if let Some(handle) = self.deadlines.get(&token) {
            self.timers
                .adjust(*handle, Instant::now() + 3 * self.config.timeslot);
        }
    }

    /// Advance the wheel and evict everything expired, then schedule the
    /// next alarm.
    fn tick(&mut self) {
        self.tick_pending = false;
        for token in self.timers.tick(Instant::now()) {
            self.deadlines.remove(&token);
            if self.in_flight.contains(&token) {
                // A worker owns it right now; give it one more timeslot
                // rather than closing the socket under the worker.
                let handle = self
                    .timers
                    .add(token, Instant::now() + self.config.timeslot);
                self.deadlines.insert(token, handle);
                continue;
            }
            debug!(token = token.0, "idle deadline expired");
            self.evict(token);
        }
        schedule_alarm(self.config.timeslot);
    }

    /// Removes a connection: out of the readiness set, socket closed,
    /// deadline dropped, user count decremented.
    fn evict(&mut self, token: Token) {
        let Some(conn) = self.connections.get(token.0).cloned() else {
            return;
        };

        {
            let mut locked = lock(&conn);
            let _ = locked.deregister(self.poll.registry());
            self.user_count -= 1;
            info!(peer = %locked.peer(), active = self.user_count, "closing connection");
        }
        self.connections.try_remove(token.0);
        if let Some(handle) = self.deadlines.remove(&token) {
            self.timers.remove(handle);
        }
    }

    /// Cooperative teardown: stop accepting, unstick the workers, close
    /// every remaining connection, join the pool.
    fn shutdown(&mut self) {
        info!(active = self.user_count, "shutting down");
        let _ = self.poll.registry().deregister(&mut self.listener);

        // Dropping the queue unblocks every worker recv.
        self.work = None;

        for token in self.timers.drain() {
            self.deadlines.remove(&token);
            if let Some(conn) = self.connections.try_remove(token.0) {
                let mut locked = lock(&conn);
                let _ = locked.deregister(self.poll.registry());
                self.user_count -= 1;
            }
        }
        self.connections.clear();
        self.in_flight.clear();

        if let Some(workers) = self.workers.take() {
            workers.join();
        }
        info!("shutdown complete");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.listener.local_addr().ok())
            .field("connections", &self.connections.len())
            .field("user_count", &self.user_count)
            .finish_non_exhaustive()
    }
}

fn lock(conn: &Arc<Mutex<HttpConnection>>) -> MutexGuard<'_, HttpConnection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Schedules the next SIGALRM, keeping tick cadence independent of I/O
/// load.
fn schedule_alarm(timeslot: Duration) {
    // Safety: alarm(2) just replaces the pending alarm for this process.
    unsafe { libc::alarm(timeslot.as_secs().max(1) as u32) };
}
