//! Request routing and response preparation
//!
//! Maps a parsed request onto a file under the document root, running the
//! login and registration flows for the two form endpoints. The character
//! right after the last `/` of the target selects the route, matching the
//! site's page naming scheme.

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use memmap2::Mmap;
use tracing::{info, warn};

use crate::db::{UserStore, UserTable};
use crate::parser::request::Request;
use crate::response::Status;

/// What the responder decided to send.
#[derive(Debug)]
pub enum Reply {
    /// 200 with the mapped file. `None` for a zero-length file, which
    /// cannot be mapped and needs no second write segment.
    File(Option<Mmap>),
    /// An error status, served with its canned body.
    Error(Status),
}

/// The responder: document root plus the credential cache.
#[derive(Debug)]
pub struct Responder {
    doc_root: PathBuf,
    users: UserTable,
}

impl Responder {
    /// Creates a responder serving files under `doc_root`.
    pub fn new(doc_root: PathBuf, users: UserTable) -> Self {
        Self { doc_root, users }
    }

    /// Produces the reply for one complete request. `body` carries the raw
    /// form bytes when the request had any; the borrowed `store` is only
    /// touched by registration.
    pub fn respond<S: UserStore>(
        &self,
        req: &Request,
        body: Option<&[u8]>,
        store: &mut S,
    ) -> Reply {
        match self.route(req, body, store) {
            Ok(page) => self.serve(&page),
            Err(status) => Reply::Error(status),
        }
    }

    /// Resolves the target to the page that should be served.
    fn route<S: UserStore>(
        &self,
        req: &Request,
        body: Option<&[u8]>,
        store: &mut S,
    ) -> Result<String, Status> {
        let target = req.target.as_str();
        let flag = target
            .rfind('/')
            .and_then(|slash| target[slash + 1..].chars().next());

        match flag {
            Some('2') if req.form => self.login(body),
            Some('3') if req.form => self.register(body, store),
            Some('0') => Ok("/register.html".to_string()),
            Some('1') => Ok("/log.html".to_string()),
            Some('5') => Ok("/picture.html".to_string()),
            Some('6') => Ok("/video.html".to_string()),
            Some('7') => Ok("/fans.html".to_string()),
            _ => Ok(target.to_string()),
        }
    }

    fn login(&self, body: Option<&[u8]>) -> Result<String, Status> {
        let (name, password) = credentials(body)?;
        if self.users.verify(&name, &password) {
            info!(user = %name, "login succeeded");
            Ok("/welcome.html".to_string())
        } else {
            info!(user = %name, "login failed");
            Ok("/logError.html".to_string())
        }
    }

    fn register<S: UserStore>(
        &self,
        body: Option<&[u8]>,
        store: &mut S,
    ) -> Result<String, Status> {
        let (name, password) = credentials(body)?;
        if self.users.contains(&name) {
            info!(user = %name, "registration rejected, name taken");
            return Ok("/registerError.html".to_string());
        }

        match store.insert_user(&name, &password) {
            Ok(()) => {
                info!(user = %name, "registered new user");
                self.users.insert(name, password);
                Ok("/log.html".to_string())
            }
            Err(err) => {
                warn!(user = %name, error = %err, "registration insert failed");
                Ok("/registerError.html".to_string())
            }
        }
    }

    /// Stats, opens, and maps the file behind `target`. The descriptor is
    /// closed as soon as the mapping exists.
    fn serve(&self, target: &str) -> Reply {
        let path = self.doc_root.join(target.trim_start_matches('/'));

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Reply::Error(Status::NotFound),
        };
        if meta.permissions().mode() & 0o004 == 0 {
            return Reply::Error(Status::Forbidden);
        }
        if meta.is_dir() {
            return Reply::Error(Status::BadRequest);
        }
        if meta.len() == 0 {
            return Reply::File(None);
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "open failed after stat");
                return Reply::Error(Status::InternalError);
            }
        };

        // Safety: the mapping is read-only; the pages under the document
        // root are never written by this process.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => Reply::File(Some(map)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "mmap failed");
                Reply::Error(Status::InternalError)
            }
        }
    }
}

/// Splits `user=<name>&password=<pw>`. Fields are capped at 99 bytes; any
/// grammar violation is a 400.
fn credentials(body: Option<&[u8]>) -> Result<(String, String), Status> {
    let Some(body) = body else {
        return Err(Status::BadRequest);
    };
    let Ok(text) = std::str::from_utf8(body) else {
        return Err(Status::BadRequest);
    };
    let Some((user, pass)) = text.split_once('&') else {
        return Err(Status::BadRequest);
    };
    let Some(name) = user.strip_prefix("user=") else {
        return Err(Status::BadRequest);
    };
    let Some(password) = pass.strip_prefix("password=") else {
        return Err(Status::BadRequest);
    };
    if name.len() > 99 || password.len() > 99 {
        return Err(Status::BadRequest);
    }

    Ok((name.to_string(), password.to_string()))
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{Reply, Responder};
    use crate::db::{MemoryStore, UserStore, UserTable};
    use crate::error::{Error, Result};
    use crate::parser::request::Request;
    use crate::response::Status;

    static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

    /// Store whose inserts always fail, standing in for a dead database.
    #[derive(Debug)]
    struct FailingStore;

    impl UserStore for FailingStore {
        fn load_users(&mut self) -> Result<Vec<(String, String)>> {
            Ok(Vec::new())
        }

        fn insert_user(&mut self, _name: &str, _password: &str) -> Result<()> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "database is gone",
            )))
        }
    }

    fn doc_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "brisk-handler-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn get(target: &str) -> Request {
        Request {
            target: target.to_string(),
            ..Request::default()
        }
    }

    fn form(target: &str) -> Request {
        Request {
            target: target.to_string(),
            form: true,
            ..Request::default()
        }
    }

    fn mapped(reply: Reply) -> Vec<u8> {
        match reply {
            Reply::File(Some(map)) => map.to_vec(),
            other => panic!("expected a mapped file, got {other:?}"),
        }
    }

    #[test]
    fn serves_existing_file_with_mapped_contents() {
        let root = doc_root();
        fs::write(root.join("homepage.html"), "<html><body>hi</body></html>").unwrap();
        let responder = Responder::new(root, UserTable::new());

        let reply = responder.respond(&get("/homepage.html"), None, &mut MemoryStore::new());
        assert_eq!(b"<html><body>hi</body></html>".to_vec(), mapped(reply));
    }

    #[test]
    fn missing_file_is_not_found() {
        let responder = Responder::new(doc_root(), UserTable::new());

        let reply = responder.respond(&get("/nope"), None, &mut MemoryStore::new());
        assert!(matches!(reply, Reply::Error(Status::NotFound)));
    }

    #[test]
    fn directory_target_is_bad_request() {
        let root = doc_root();
        fs::create_dir(root.join("images")).unwrap();
        let responder = Responder::new(root, UserTable::new());

        let reply = responder.respond(&get("/images"), None, &mut MemoryStore::new());
        assert!(matches!(reply, Reply::Error(Status::BadRequest)));
    }

    #[test]
    fn file_without_world_read_permission_is_forbidden() {
        let root = doc_root();
        let secret = root.join("secret.html");
        fs::write(&secret, "hidden").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();
        let responder = Responder::new(root, UserTable::new());

        let reply = responder.respond(&get("/secret.html"), None, &mut MemoryStore::new());
        assert!(matches!(reply, Reply::Error(Status::Forbidden)));
    }

    #[test]
    fn zero_length_file_serves_without_a_mapping() {
        let root = doc_root();
        fs::write(root.join("empty.html"), "").unwrap();
        let responder = Responder::new(root, UserTable::new());

        let reply = responder.respond(&get("/empty.html"), None, &mut MemoryStore::new());
        assert!(matches!(reply, Reply::File(None)));
    }

    #[test]
    fn numeric_flags_route_to_their_pages() {
        let root = doc_root();
        fs::write(root.join("register.html"), "register").unwrap();
        fs::write(root.join("log.html"), "log in").unwrap();
        fs::write(root.join("picture.html"), "pictures").unwrap();
        let responder = Responder::new(root, UserTable::new());
        let mut store = MemoryStore::new();

        assert_eq!(
            b"register".to_vec(),
            mapped(responder.respond(&get("/0"), None, &mut store))
        );
        assert_eq!(
            b"log in".to_vec(),
            mapped(responder.respond(&get("/1login"), None, &mut store))
        );
        assert_eq!(
            b"pictures".to_vec(),
            mapped(responder.respond(&get("/5pics"), None, &mut store))
        );
    }

    #[test]
    fn login_with_matching_credentials_serves_welcome() {
        let root = doc_root();
        fs::write(root.join("welcome.html"), "welcome").unwrap();
        let users = UserTable::from_rows(vec![("alice".to_string(), "pw12".to_string())]);
        let responder = Responder::new(root, users);

        let reply = responder.respond(
            &form("/2login"),
            Some(b"user=alice&password=pw12"),
            &mut MemoryStore::new(),
        );
        assert_eq!(b"welcome".to_vec(), mapped(reply));
    }

    #[test]
    fn login_with_wrong_password_serves_log_error() {
        let root = doc_root();
        fs::write(root.join("logError.html"), "bad login").unwrap();
        let users = UserTable::from_rows(vec![("alice".to_string(), "pw12".to_string())]);
        let responder = Responder::new(root, users);

        let reply = responder.respond(
            &form("/2login"),
            Some(b"user=alice&password=wrong"),
            &mut MemoryStore::new(),
        );
        assert_eq!(b"bad login".to_vec(), mapped(reply));
    }

    #[test]
    fn registration_persists_and_serves_the_login_page() {
        let root = doc_root();
        fs::write(root.join("log.html"), "log in").unwrap();
        let responder = Responder::new(root, UserTable::new());
        let mut store = MemoryStore::new();

        let reply = responder.respond(
            &form("/3register"),
            Some(b"user=alice&password=pw12"),
            &mut store,
        );
        assert_eq!(b"log in".to_vec(), mapped(reply));
        assert_eq!(
            vec![("alice".to_string(), "pw12".to_string())],
            store.rows()
        );
    }

    #[test]
    fn duplicate_registration_serves_register_error() {
        let root = doc_root();
        fs::write(root.join("registerError.html"), "taken").unwrap();
        let users = UserTable::from_rows(vec![("alice".to_string(), "pw12".to_string())]);
        let responder = Responder::new(root, users);
        let mut store = MemoryStore::new();

        let reply = responder.respond(
            &form("/3register"),
            Some(b"user=alice&password=other"),
            &mut store,
        );
        assert_eq!(b"taken".to_vec(), mapped(reply));
        assert!(store.rows().is_empty());
    }

    #[test]
    fn failed_insert_serves_register_error() {
        let root = doc_root();
        fs::write(root.join("registerError.html"), "try later").unwrap();
        let responder = Responder::new(root, UserTable::new());

        let reply = responder.respond(
            &form("/3register"),
            Some(b"user=alice&password=pw12"),
            &mut FailingStore,
        );
        assert_eq!(b"try later".to_vec(), mapped(reply));
    }

    #[test]
    fn malformed_form_body_is_bad_request() {
        let responder = Responder::new(doc_root(), UserTable::new());
        let mut store = MemoryStore::new();

        for body in [
            &b"password=pw12"[..],
            b"user=alice",
            b"name=alice&password=pw12",
            b"",
        ] {
            let reply = responder.respond(&form("/2login"), Some(body), &mut store);
            assert!(matches!(reply, Reply::Error(Status::BadRequest)));
        }
    }

    #[test]
    fn oversized_form_field_is_bad_request() {
        let responder = Responder::new(doc_root(), UserTable::new());
        let body = format!("user={}&password=pw", "a".repeat(100));

        let reply = responder.respond(
            &form("/2login"),
            Some(body.as_bytes()),
            &mut MemoryStore::new(),
        );
        assert!(matches!(reply, Reply::Error(Status::BadRequest)));
    }
}
