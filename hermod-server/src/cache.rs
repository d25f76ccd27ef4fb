//! The message cache contract and an in-memory reference implementation.
//!
//! Two entry kinds share the id namespace:
//! * **mail** — one-shot; `get_or_del` returns it once and deletes it.
//! * **poster** — keyed and read-many; re-setting the same user key
//!   supersedes the previous content under the *same* id, so every id ever
//!   handed out for that key resolves to the latest value.
//!
//! TTL = 0 means the cache imposes no expiry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hermod_wire::Message;

// ─── Error ───────────────────────────────────────────────────────────────────

/// A backend failure. Cache errors never close connections; they surface to
/// the caller of the send APIs.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheError {
    /// Backend-supplied description.
    pub message: String,
}

impl CacheError {
    /// Wrap a backend error message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache: {}", self.message)
    }
}

impl std::error::Error for CacheError {}

// ─── Contract ────────────────────────────────────────────────────────────────

/// Durable (TTL-bounded) storage for undelivered messages.
///
/// Implementations are external collaborators (a redis-style backend in
/// production); [`MemoryCache`] below backs the test suites.
pub trait MessageCache: Send + Sync {
    /// Store a one-shot mail entry; returns its cache id.
    fn set_mail(
        &self,
        service: &str,
        user:    &str,
        msg:     &Message,
        ttl:     Duration,
    ) -> Result<String, CacheError>;

    /// Store (or overwrite) a keyed poster entry; returns its cache id.
    fn set_poster(
        &self,
        service: &str,
        user:    &str,
        key:     &str,
        msg:     &Message,
        ttl:     Duration,
    ) -> Result<String, CacheError>;

    /// Fetch an entry by id. Deletes it iff it is mail. Unknown or expired
    /// ids return `Ok(None)`, not an error.
    fn get_or_del(
        &self,
        service: &str,
        user:    &str,
        id:      &str,
    ) -> Result<Option<Message>, CacheError>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

const MAIL_PREFIX: &str = "m";
const POSTER_PREFIX: &str = "p:";

struct Entry {
    msg:        Message,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local [`MessageCache`] with lazy expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(String, String, String), Entry>>,
}

impl MemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn store(
        &self,
        service: &str,
        user:    &str,
        id:      String,
        msg:     &Message,
        ttl:     Duration,
    ) -> String {
        let expires_at = if ttl.is_zero() { None } else { Some(Instant::now() + ttl) };
        self.entries.lock().expect("cache lock").insert(
            (service.to_owned(), user.to_owned(), id.clone()),
            Entry { msg: msg.clone(), expires_at },
        );
        id
    }
}

impl MessageCache for MemoryCache {
    fn set_mail(
        &self,
        service: &str,
        user:    &str,
        msg:     &Message,
        ttl:     Duration,
    ) -> Result<String, CacheError> {
        let mut raw = [0u8; 12];
        getrandom::getrandom(&mut raw).expect("getrandom");
        let id = format!("{MAIL_PREFIX}{}", hex::encode(raw));
        Ok(self.store(service, user, id, msg, ttl))
    }

    fn set_poster(
        &self,
        service: &str,
        user:    &str,
        key:     &str,
        msg:     &Message,
        ttl:     Duration,
    ) -> Result<String, CacheError> {
        // Deterministic id per user key: re-sets land on the same entry.
        let id = format!("{POSTER_PREFIX}{}", hex::encode(key.as_bytes()));
        Ok(self.store(service, user, id, msg, ttl))
    }

    fn get_or_del(
        &self,
        service: &str,
        user:    &str,
        id:      &str,
    ) -> Result<Option<Message>, CacheError> {
        let full = (service.to_owned(), user.to_owned(), id.to_owned());
        let mut entries = self.entries.lock().expect("cache lock");

        let Some(entry) = entries.get(&full) else {
            return Ok(None);
        };
        if entry.expired(Instant::now()) {
            entries.remove(&full);
            return Ok(None);
        }

        if id.starts_with(POSTER_PREFIX) {
            Ok(Some(entry.msg.clone()))
        } else {
            Ok(entries.remove(&full).map(|e| e.msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &[u8]) -> Message {
        let mut msg = Message::with_body(body.to_vec());
        msg.header.insert("aaa".into(), "hello".into());
        msg.header.insert("aa".into(), "hell".into());
        msg
    }

    #[test]
    fn mail_is_read_once() {
        let cache = MemoryCache::new();
        let msg = message(b"mail body");
        let id = cache.set_mail("srv", "usr", &msg, Duration::ZERO).unwrap();

        let first = cache.get_or_del("srv", "usr", &id).unwrap().unwrap();
        assert!(first.eq_content(&msg));
        assert_eq!(cache.get_or_del("srv", "usr", &id).unwrap(), None);
    }

    #[test]
    fn poster_is_read_many() {
        let cache = MemoryCache::new();
        let msg = message(b"poster body");
        let id = cache.set_poster("srv", "usr", "home", &msg, Duration::ZERO).unwrap();

        for _ in 0..2 {
            let got = cache.get_or_del("srv", "usr", &id).unwrap().unwrap();
            assert!(got.eq_content(&msg));
        }
    }

    #[test]
    fn poster_reset_supersedes_under_same_id() {
        let cache = MemoryCache::new();
        let first = message(b"first");
        let second = message(b"second");

        let id_a = cache.set_poster("srv", "usr", "home", &first, Duration::ZERO).unwrap();
        let id_b = cache.set_poster("srv", "usr", "home", &second, Duration::ZERO).unwrap();
        assert_eq!(id_a, id_b);

        let got = cache.get_or_del("srv", "usr", &id_a).unwrap().unwrap();
        assert!(got.eq_content(&second));
    }

    #[test]
    fn unknown_id_is_none_not_error() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get_or_del("srv", "usr", "nonexistent").unwrap(), None);
    }

    #[test]
    fn entries_are_scoped_per_service_and_user() {
        let cache = MemoryCache::new();
        let msg = message(b"scoped");
        let id = cache.set_mail("srv", "usr", &msg, Duration::ZERO).unwrap();

        assert_eq!(cache.get_or_del("other", "usr", &id).unwrap(), None);
        assert_eq!(cache.get_or_del("srv", "other", &id).unwrap(), None);
        assert!(cache.get_or_del("srv", "usr", &id).unwrap().is_some());
    }

    #[test]
    fn ttl_expires_entries() {
        let cache = MemoryCache::new();
        let msg = message(b"short-lived");
        let id = cache
            .set_mail("srv", "usr", &msg, Duration::from_millis(30))
            .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get_or_del("srv", "usr", &id).unwrap(), None);
    }

    #[test]
    fn zero_ttl_never_expires() {
        let cache = MemoryCache::new();
        let msg = message(b"durable");
        let id = cache.set_mail("srv", "usr", &msg, Duration::ZERO).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get_or_del("srv", "usr", &id).unwrap().is_some());
    }

    #[test]
    fn mail_ids_are_unique() {
        let cache = MemoryCache::new();
        let msg = message(b"x");
        let a = cache.set_mail("srv", "usr", &msg, Duration::ZERO).unwrap();
        let b = cache.set_mail("srv", "usr", &msg, Duration::ZERO).unwrap();
        assert_ne!(a, b);
    }
}
