//! End-to-end scenarios over real sockets.
//!
//! Each test runs a full server — reactor, workers, timer wheel — on an
//! ephemeral loopback port, with an in-memory user store and a temporary
//! document root.

use std::fs;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use brisk::config::Config;
use brisk::db::{MemoryStore, Pool, UserTable};
use brisk::listener::{Server, ShutdownHandle};

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

const HOMEPAGE: &str = "<html><body>hi</body></html>";

/// A running server plus everything needed to talk to it and tear it down.
struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(store: MemoryStore, users: UserTable, tweak: impl FnOnce(&mut Config)) -> Self {
        let root = doc_root();
        fs::write(root.join("homepage.html"), HOMEPAGE).unwrap();
        fs::write(root.join("log.html"), "log page").unwrap();
        fs::write(root.join("welcome.html"), "welcome page").unwrap();
        fs::write(root.join("logError.html"), "login error page").unwrap();
        fs::write(root.join("registerError.html"), "register error page").unwrap();

        let mut config = Config {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            doc_root: root,
            workers: 2,
            ..Config::default()
        };
        tweak(&mut config);

        let pool = Pool::new(vec![store.clone(), store]).unwrap();
        let mut server = Server::new(config, pool, users).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || {
            let _ = server.run();
        });

        Self {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(15)))
            .unwrap();
        stream
    }

    /// One request on its own connection, reading until the server closes.
    fn request(&self, raw: &[u8]) -> Vec<u8> {
        let mut stream = self.connect();
        stream.write_all(raw).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        response
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn doc_root() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "brisk-e2e-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    stream.read_exact(&mut out).unwrap();
    out
}

#[test]
fn static_get_returns_the_exact_response_bytes() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |_| {});

    let response =
        server.request(b"GET /homepage.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");

    let expected = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: Close\r\nContent-Type: text/html\r\n\r\n{}",
        HOMEPAGE.len(),
        HOMEPAGE
    );
    assert_eq!(expected.into_bytes(), response);
}

#[test]
fn root_target_serves_the_homepage() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |_| {});

    let response = server.request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with(HOMEPAGE));
}

#[test]
fn missing_file_returns_404_with_the_canned_form() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |_| {});

    let response = server.request(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n");

    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(text.contains("Content-Type: text/html\r\n\r\n"));
    assert!(text.ends_with("The requested file was not found on this server.\n"));
}

#[test]
fn registration_then_login_round_trip() {
    let store = MemoryStore::new();
    let server = TestServer::start(store.clone(), UserTable::new(), |_| {});

    // New registration lands on the login page and persists the user.
    let response = server.request(
        b"POST /3register HTTP/1.1\r\nHost: x\r\nContent-Length: 24\r\n\r\nuser=alice&password=pw12",
    );
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("log page"));
    assert_eq!(
        vec![("alice".to_string(), "pw12".to_string())],
        store.rows()
    );

    // Matching credentials reach the welcome page.
    let response = server.request(
        b"POST /2login HTTP/1.1\r\nHost: x\r\nContent-Length: 24\r\n\r\nuser=alice&password=pw12",
    );
    assert!(String::from_utf8(response).unwrap().ends_with("welcome page"));

    // A wrong password lands on the login-error page.
    let response = server.request(
        b"POST /2login HTTP/1.1\r\nHost: x\r\nContent-Length: 25\r\n\r\nuser=alice&password=wrong",
    );
    assert!(String::from_utf8(response)
        .unwrap()
        .ends_with("login error page"));

    // Registering the same name again lands on the register-error page.
    let response = server.request(
        b"POST /3register HTTP/1.1\r\nHost: x\r\nContent-Length: 25\r\n\r\nuser=alice&password=other",
    );
    assert!(String::from_utf8(response)
        .unwrap()
        .ends_with("register error page"));
    assert_eq!(1, store.rows().len());
}

#[test]
fn keep_alive_serves_two_requests_on_one_connection() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |_| {});
    let mut stream = server.connect();

    stream
        .write_all(b"GET /homepage.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let first = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: Keep-Alive\r\nContent-Type: text/html\r\n\r\n{}",
        HOMEPAGE.len(),
        HOMEPAGE
    );
    assert_eq!(
        first.as_bytes().to_vec(),
        read_exact_len(&mut stream, first.len())
    );

    // The connection stayed open; the second request flows over it.
    stream
        .write_all(b"GET /log.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    let text = String::from_utf8(rest).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Connection: Close\r\n"));
    assert!(text.ends_with("log page"));
}

#[test]
fn request_split_into_tiny_writes_parses_the_same() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |_| {});
    let mut stream = server.connect();

    let raw = b"GET /homepage.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    for chunk in raw.chunks(3) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    assert!(String::from_utf8(response).unwrap().ends_with(HOMEPAGE));
}

#[test]
fn oversized_content_length_closes_without_a_response() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |_| {});

    let response = server
        .request(b"POST /3register HTTP/1.1\r\nHost: x\r\nContent-Length: 4096\r\n\r\n");
    assert!(response.is_empty());
}

#[test]
fn connections_beyond_the_cap_get_the_busy_reply() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |config| {
        config.max_clients = 1;
    });

    let _held = server.connect();
    thread::sleep(Duration::from_millis(100));

    let mut refused = server.connect();
    let mut reply = Vec::new();
    refused.read_to_end(&mut reply).unwrap();
    assert_eq!(b"Internal Server Busy".to_vec(), reply);
}

#[test]
fn idle_connection_is_evicted_by_the_timer_wheel() {
    let server = TestServer::start(MemoryStore::new(), UserTable::new(), |config| {
        config.timeslot = Duration::from_secs(1);
    });

    let mut stream = server.connect();
    stream.write_all(b"GET /homepa").unwrap();

    // Stalled mid-request-line: the wheel must close the socket once three
    // timeslots pass without further bytes.
    let started = Instant::now();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(2));
}
