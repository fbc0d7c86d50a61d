//! Persisted session store. Sessions live in an in-memory cache backed by
//! `sessions.properties` in the content root: one line per session, keyed by
//! the opaque token, with the value holding `` ip`username`creation_millis ``.
//! Every mutation persists before returning; reloads are debounced and evict
//! expired sessions from cache and file in one batch.

use rand::{distr::Alphanumeric, Rng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::props;

pub const SESSIONS_FILE: &str = "sessions.properties";

/// Minimum gap between two actual re-reads of the session file.
const RELOAD_COOLDOWN: Duration = Duration::from_secs(5);

/// Length of a session token: 32 alphanumeric characters.
const TOKEN_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub ip: String,
    pub username: String,
    /// Creation time in epoch milliseconds.
    pub created_at: u64,
}

impl Session {
    /// Decode a persisted record. Missing fields default (a zero creation
    /// time makes the session expired, so damaged records age out on the
    /// next reload instead of crashing it).
    fn decode(value: &str) -> Session {
        let parts = props::split_list(value);
        Session {
            ip: parts.first().cloned().unwrap_or_else(|| "IP-UNKNOWN".to_string()),
            username: parts.get(1).cloned().unwrap_or_default(),
            created_at: parts
                .get(2)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_default(),
        }
    }

    fn encode(&self) -> String {
        format!("{}`{}`{}", self.ip, self.username, self.created_at)
    }

    pub fn is_expired(&self, now_millis: u64, max_age: Duration) -> bool {
        now_millis.saturating_sub(self.created_at) >= max_age.as_millis() as u64
    }
}

struct Inner {
    cache: HashMap<String, Session>,
    last_reload: Option<Instant>,
}

pub struct SessionStore {
    path: PathBuf,
    cookie_age: Duration,
    inner: RwLock<Inner>,
}

impl SessionStore {
    /// Open the store backing file under `dir` and load it.
    pub fn open(dir: &Path, cookie_age: Duration) -> SessionStore {
        let store = SessionStore {
            path: dir.join(SESSIONS_FILE),
            cookie_age,
            inner: RwLock::new(Inner {
                cache: HashMap::new(),
                last_reload: None,
            }),
        };
        store.reload();
        store
    }

    /// Re-read the persisted sessions, then evict everything past its TTL
    /// from both cache and file. No-op inside the reload cool-down.
    pub fn reload(&self) {
        let mut inner = self.inner.write().unwrap();
        if let Some(last) = inner.last_reload {
            if last.elapsed() < RELOAD_COOLDOWN {
                tracing::info!("Blocking session reload");
                return;
            }
        }
        inner.last_reload = Some(Instant::now());

        let map = match props::load(&self.path) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!("Cannot read {}: {}", self.path.display(), e);
                return;
            }
        };

        inner.cache = map
            .into_iter()
            .map(|(token, value)| (token, Session::decode(&value)))
            .collect();

        let now = now_millis();
        let expired: Vec<String> = inner
            .cache
            .iter()
            .filter(|(_, session)| session.is_expired(now, self.cookie_age))
            .map(|(token, _)| token.clone())
            .collect();

        for token in &expired {
            inner.cache.remove(token);
        }
        if !expired.is_empty() {
            tracing::info!("Evicted {} expired sessions", expired.len());
            self.persist(&inner);
        }
        tracing::info!("Sessions: {}", inner.cache.len());
    }

    /// Mint a session for a logged-in user and persist it. A failed save is
    /// logged; the session stays valid in-memory for this process either way.
    pub fn create_session(&self, ip: &str, username: &str) -> String {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();

        let session = Session {
            ip: ip.to_string(),
            username: username.to_string(),
            created_at: now_millis(),
        };

        let mut inner = self.inner.write().unwrap();
        inner.cache.insert(token.clone(), session);
        inner.last_reload = Some(Instant::now());
        self.persist(&inner);
        tracing::info!("Created session for {}", username);
        token
    }

    pub fn has_session(&self, token: &str) -> bool {
        self.inner.read().unwrap().cache.contains_key(token)
    }

    pub fn name_for(&self, token: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .cache
            .get(token)
            .map(|session| session.username.clone())
    }

    /// Drop one session. Saves only if something was actually removed.
    pub fn invalidate(&self, token: &str) {
        let mut inner = self.inner.write().unwrap();
        if inner.cache.remove(token).is_some() {
            self.persist(&inner);
        }
    }

    /// Drop every session belonging to `username`.
    pub fn invalidate_all_for(&self, username: &str) {
        if username.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        inner.cache.retain(|_, session| session.username != username);
        self.persist(&inner);
    }

    /// Wipe the cache and the persisted store.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.cache.clear();
        self.persist(&inner);
    }

    /// Snapshot of all live sessions, for the admin overview.
    pub fn sessions(&self) -> Vec<(String, Session)> {
        self.inner
            .read()
            .unwrap()
            .cache
            .iter()
            .map(|(token, session)| (token.clone(), session.clone()))
            .collect()
    }

    fn persist(&self, inner: &Inner) {
        let map = inner
            .cache
            .iter()
            .map(|(token, session)| (token.clone(), session.encode()))
            .collect();
        if let Err(e) = props::save(&self.path, &map) {
            tracing::error!("Cannot save {}: {}", self.path.display(), e);
        }
    }

    /// Pull the last reload out of the cool-down window so tests can force a
    /// second re-read without sleeping through it.
    #[cfg(test)]
    pub fn rewind_cooldown(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.last_reload = inner
            .last_reload
            .and_then(|last| last.checked_sub(RELOAD_COOLDOWN * 2));
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    fn make_store(cookie_age: Duration) -> (SessionStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path(), cookie_age);
        (store, dir)
    }

    #[test]
    fn create_and_look_up() {
        let (store, dir) = make_store(Duration::from_secs(100));
        let token = store.create_session("10.0.0.1", "alice");

        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(store.has_session(&token));
        assert_eq!(store.name_for(&token).as_deref(), Some("alice"));

        // Persisted synchronously.
        let on_disk = props::load(&dir.path().join(SESSIONS_FILE)).unwrap();
        assert!(on_disk.contains_key(&token));
    }

    #[test]
    fn ttl_boundary() {
        let max_age = Duration::from_secs(100);
        let session = Session {
            ip: "10.0.0.1".to_string(),
            username: "alice".to_string(),
            created_at: 1_000_000,
        };
        assert!(!session.is_expired(1_000_000 + 99_000, max_age));
        assert!(session.is_expired(1_000_000 + 101_000, max_age));
    }

    #[test]
    fn reload_evicts_expired_from_cache_and_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SESSIONS_FILE);

        let mut map = BTreeMap::new();
        map.insert("staletoken".to_string(), "10.0.0.1`alice`1".to_string());
        map.insert(
            "freshtoken".to_string(),
            format!("10.0.0.2`bob`{}", now_millis()),
        );
        props::save(&path, &map).unwrap();

        let store = SessionStore::open(dir.path(), Duration::from_secs(100));
        assert!(!store.has_session("staletoken"));
        assert!(store.has_session("freshtoken"));

        let on_disk = props::load(&path).unwrap();
        assert!(!on_disk.contains_key("staletoken"));
        assert!(on_disk.contains_key("freshtoken"));
    }

    #[test]
    fn reload_is_debounced() {
        let (store, dir) = make_store(Duration::from_secs(100));
        let path = dir.path().join(SESSIONS_FILE);

        // A session written behind the store's back.
        let mut map = props::load(&path).unwrap();
        map.insert(
            "outsidetoken".to_string(),
            format!("10.0.0.3`carol`{}", now_millis()),
        );
        props::save(&path, &map).unwrap();

        // Within the cool-down the reload is a no-op.
        store.reload();
        assert!(!store.has_session("outsidetoken"));

        // Once the window has elapsed it re-reads.
        store.rewind_cooldown();
        store.reload();
        assert!(store.has_session("outsidetoken"));
    }

    #[test]
    fn invalidate_variants() {
        let (store, _dir) = make_store(Duration::from_secs(100));
        let a1 = store.create_session("10.0.0.1", "alice");
        let a2 = store.create_session("10.0.0.2", "alice");
        let b = store.create_session("10.0.0.3", "bob");

        store.invalidate(&a1);
        assert!(!store.has_session(&a1));
        assert!(store.has_session(&a2));

        store.invalidate_all_for("alice");
        assert!(!store.has_session(&a2));
        assert!(store.has_session(&b));

        store.invalidate_all();
        assert!(!store.has_session(&b));
        assert!(store.sessions().is_empty());
    }

    #[test]
    fn damaged_record_decodes_as_expired() {
        let session = Session::decode("only-an-ip");
        assert_eq!(session.created_at, 0);
        assert!(session.is_expired(now_millis(), Duration::from_secs(100)));
    }
}
