//! Credential store. Usernames map to argon2 PHC hashes in
//! `users.properties`; a handful of reserved keys carry the role data (the
//! admin list, the single master, the admin-only flag) and the calibrated
//! hash iteration count. Reserved keys can never be usernames, checked on
//! every lookup and mutation.

use anyhow::anyhow;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::{distr::Alphanumeric, Rng};
use rand_core::OsRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const USERS_FILE: &str = "users.properties";

/// Control keys that can never be used as usernames.
pub const RESERVED_KEYS: [&str; 4] = ["iterations", "admin", "master", "adminOnly"];

const RELOAD_COOLDOWN: Duration = Duration::from_secs(5);

/// Wall-clock budget for one hash when calibrating the iteration count.
const CALIBRATION_BUDGET: Duration = Duration::from_secs(1);

/// Fallback when the persisted iteration count is unparseable.
const FALLBACK_ITERATIONS: u32 = 3;

const DEFAULT_MASTER: &str = "masterUser";
const PROVISIONED_PASSWORD_LENGTH: usize = 8;

pub fn is_reserved(name: &str) -> bool {
    RESERVED_KEYS.contains(&name)
}

// ── Hashing ──────────────────────────────────────────────────────────────────

/// The injected hash/verify capability. The store never touches a hashing
/// primitive directly, so tests can swap in a cheap scheme.
pub trait PasswordScheme: Send + Sync {
    /// Hash `password` at the given iteration cost; returns a PHC string.
    fn hash(&self, password: &str, iterations: u32) -> anyhow::Result<String>;
    /// Check `password` against a stored PHC string. False on any error.
    fn verify(&self, stored: &str, password: &str) -> bool;
    /// Find the highest iteration count whose hash stays within `budget`.
    fn calibrate(&self, budget: Duration) -> u32;
}

pub struct Argon2Scheme {
    memory_kib: u32,
}

impl Default for Argon2Scheme {
    fn default() -> Self {
        Argon2Scheme { memory_kib: 65536 }
    }
}

impl Argon2Scheme {
    fn hasher(&self, iterations: u32) -> anyhow::Result<Argon2<'static>> {
        let params = Params::new(self.memory_kib, iterations, 1, None)
            .map_err(|e| anyhow!("Invalid argon2 parameters: {}", e))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl PasswordScheme for Argon2Scheme {
    fn hash(&self, password: &str, iterations: u32) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .hasher(iterations)?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("Password hashing failed: {}", e))?
            .to_string();
        Ok(hash)
    }

    fn verify(&self, stored: &str, password: &str) -> bool {
        let parsed = match PasswordHash::new(stored) {
            Ok(hash) => hash,
            Err(_) => return false,
        };
        // The PHC string carries its own parameters.
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    fn calibrate(&self, budget: Duration) -> u32 {
        let mut best = 1;
        for iterations in 1..=256 {
            let start = Instant::now();
            if self.hash("calibration-probe", iterations).is_err() {
                break;
            }
            if start.elapsed() > budget {
                break;
            }
            best = iterations;
        }
        best
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

struct Inner {
    entries: BTreeMap<String, String>,
    iterations: u32,
    last_reload: Option<Instant>,
}

pub struct CredentialStore {
    path: PathBuf,
    scheme: Box<dyn PasswordScheme>,
    inner: RwLock<Inner>,
}

impl CredentialStore {
    /// Open the store backing file under `dir`, loading it and provisioning
    /// defaults (including the master account) on first run.
    pub fn open(dir: &Path, scheme: Box<dyn PasswordScheme>) -> CredentialStore {
        let store = CredentialStore {
            path: dir.join(USERS_FILE),
            scheme,
            inner: RwLock::new(Inner {
                entries: BTreeMap::new(),
                iterations: FALLBACK_ITERATIONS,
                last_reload: None,
            }),
        };
        store.reload();
        store
    }

    /// Re-read the persisted credentials and re-derive defaults, persisting
    /// only if a default was newly written. No-op inside the cool-down.
    pub fn reload(&self) {
        let mut inner = self.inner.write().unwrap();
        if let Some(last) = inner.last_reload {
            if last.elapsed() < RELOAD_COOLDOWN {
                tracing::info!("Blocking credential reload");
                return;
            }
        }
        inner.last_reload = Some(Instant::now());

        match crate::props::load(&self.path) {
            Ok(map) => inner.entries = map,
            Err(e) => {
                tracing::error!("Cannot read {}: {}", self.path.display(), e);
                return;
            }
        }
        self.apply_defaults(&mut inner);
    }

    fn apply_defaults(&self, inner: &mut Inner) {
        let mut altered = false;

        match inner.entries.get("iterations") {
            Some(raw) => {
                inner.iterations = raw.parse().unwrap_or_else(|_| {
                    tracing::warn!("Invalid iteration count {:?}", raw);
                    FALLBACK_ITERATIONS
                });
            }
            None => {
                tracing::info!("Calibrating hash iteration count");
                let iterations = self.scheme.calibrate(CALIBRATION_BUDGET);
                tracing::info!("Using {} iterations", iterations);
                inner
                    .entries
                    .insert("iterations".to_string(), iterations.to_string());
                inner.iterations = iterations;
                altered = true;
            }
        }

        for (key, default) in [
            ("master", DEFAULT_MASTER),
            ("adminOnly", "true"),
            ("admin", ""),
        ] {
            if !inner.entries.contains_key(key) {
                inner.entries.insert(key.to_string(), default.to_string());
                altered = true;
            }
        }

        // An empty store gets one master credential with a random password,
        // logged exactly once. Operators must capture it from the log or use
        // the master-issued change path afterward.
        let has_credentials = inner.entries.keys().any(|key| !is_reserved(key));
        if !has_credentials {
            let master = inner.entries["master"].clone();
            let password = random_alphanumeric(PROVISIONED_PASSWORD_LENGTH);
            match self.scheme.hash(&password, inner.iterations) {
                Ok(hash) => {
                    tracing::warn!(
                        "Provisioned master account: username={} password={}",
                        master,
                        password
                    );
                    tracing::warn!("Change this password as soon as possible!");
                    inner.entries.insert(master, hash);
                    altered = true;
                }
                Err(e) => tracing::error!("Cannot provision master account: {}", e),
            }
        }

        if altered {
            self.persist(inner);
        }
    }

    // ── Authentication ───────────────────────────────────────────────────────

    /// Check a login attempt. Rejects empty and reserved usernames before
    /// ever touching the hash.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || is_reserved(username) {
            return false;
        }
        // Clone out of the lock: verification is deliberately slow.
        let stored = match self.inner.read().unwrap().entries.get(username) {
            Some(hash) => hash.clone(),
            None => return false,
        };
        self.scheme.verify(&stored, password)
    }

    // ── User management ──────────────────────────────────────────────────────

    pub fn add_user(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || is_reserved(username) {
            return false;
        }
        if self.inner.read().unwrap().entries.contains_key(username) {
            return false;
        }
        self.set_password(username, password)
    }

    /// Remove a credential, also stripping the user from the admin list.
    pub fn remove_user(&self, username: &str) -> bool {
        if is_reserved(username) {
            return false;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.entries.remove(username).is_none() {
            return false;
        }
        let mut admins = admin_list(&inner);
        if let Some(index) = admins.iter().position(|name| name == username) {
            admins.remove(index);
            set_admin_list(&mut inner, &admins);
        }
        self.persist(&inner);
        true
    }

    /// Sorted usernames, reserved control keys excluded.
    pub fn usernames(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .entries
            .keys()
            .filter(|key| !is_reserved(key))
            .cloned()
            .collect()
    }

    // ── Roles ────────────────────────────────────────────────────────────────

    pub fn is_master(&self, username: &str) -> bool {
        if username.is_empty() || is_reserved(username) {
            return false;
        }
        let inner = self.inner.read().unwrap();
        inner.entries.get("master").map(String::as_str) == Some(username)
    }

    /// Master is implicitly admin; everyone else must be on the admin list.
    pub fn is_admin(&self, username: &str) -> bool {
        if username.is_empty() || is_reserved(username) {
            return false;
        }
        let inner = self.inner.read().unwrap();
        if inner.entries.get("master").map(String::as_str) == Some(username) {
            return true;
        }
        admin_list(&inner).iter().any(|name| name == username)
    }

    /// Appoint an admin. Only the master may do this; appointing a reserved
    /// key or an existing admin fails.
    pub fn add_admin(&self, username: &str, acting_user: &str) -> bool {
        if is_reserved(username) {
            return false;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.entries.get("master").map(String::as_str) != Some(acting_user) {
            return false;
        }
        let mut admins = admin_list(&inner);
        if admins.iter().any(|name| name == username) {
            return false;
        }
        admins.push(username.to_string());
        set_admin_list(&mut inner, &admins);
        self.persist(&inner);
        true
    }

    pub fn remove_admin(&self, username: &str, acting_user: &str) -> bool {
        if is_reserved(username) {
            return false;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.entries.get("master").map(String::as_str) != Some(acting_user) {
            return false;
        }
        let mut admins = admin_list(&inner);
        let Some(index) = admins.iter().position(|name| name == username) else {
            return false;
        };
        admins.remove(index);
        set_admin_list(&mut inner, &admins);
        self.persist(&inner);
        true
    }

    // ── Admin-only lockdown ──────────────────────────────────────────────────

    pub fn is_admin_only(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.entries.get("adminOnly").map(String::as_str) == Some("true")
    }

    /// Flip the lockdown flag, persist, and return the new state.
    pub fn toggle_admin_only(&self) -> bool {
        let mut inner = self.inner.write().unwrap();
        let now_enabled = inner.entries.get("adminOnly").map(String::as_str) != Some("true");
        inner
            .entries
            .insert("adminOnly".to_string(), now_enabled.to_string());
        inner.last_reload = Some(Instant::now());
        self.persist(&inner);
        now_enabled
    }

    // ── Password changes ─────────────────────────────────────────────────────

    /// Self-service change: requires re-verification of the current password.
    pub fn change_password_self(&self, username: &str, current: &str, new_password: &str) -> bool {
        if !self.verify(username, current) {
            tracing::warn!("Invalid current password for {}", username);
            return false;
        }
        self.set_password(username, new_password)
    }

    /// Master-issued change for an existing user.
    pub fn change_password_by_master(
        &self,
        acting_user: &str,
        username: &str,
        new_password: &str,
    ) -> bool {
        if !self.is_master(acting_user) {
            return false;
        }
        if is_reserved(username) || !self.inner.read().unwrap().entries.contains_key(username) {
            return false;
        }
        self.set_password(username, new_password)
    }

    /// Hash outside the lock (hashing is slow on purpose), then store.
    fn set_password(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || is_reserved(username) {
            return false;
        }
        let iterations = self.inner.read().unwrap().iterations;
        let hash = match self.scheme.hash(password, iterations) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!("Cannot hash password for {}: {}", username, e);
                return false;
            }
        };
        let mut inner = self.inner.write().unwrap();
        inner.entries.insert(username.to_string(), hash);
        self.persist(&inner);
        true
    }

    fn persist(&self, inner: &Inner) {
        if let Err(e) = crate::props::save(&self.path, &inner.entries) {
            tracing::error!("Cannot save {}: {}", self.path.display(), e);
        }
    }

    /// See `SessionStore::rewind_cooldown`.
    #[cfg(test)]
    pub fn rewind_cooldown(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.last_reload = inner
            .last_reload
            .and_then(|last| last.checked_sub(RELOAD_COOLDOWN * 2));
    }
}

fn admin_list(inner: &Inner) -> Vec<String> {
    inner
        .entries
        .get("admin")
        .map(|value| crate::props::split_list(value))
        .unwrap_or_default()
}

fn set_admin_list(inner: &mut Inner, admins: &[String]) {
    inner
        .entries
        .insert("admin".to_string(), crate::props::join_list(admins));
}

fn random_alphanumeric(length: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
pub mod testing {
    use super::PasswordScheme;
    use std::time::Duration;

    /// Cheap stand-in so tests never pay for argon2.
    pub struct PlainScheme;

    impl PasswordScheme for PlainScheme {
        fn hash(&self, password: &str, _iterations: u32) -> anyhow::Result<String> {
            Ok(format!("plain:{}", password))
        }

        fn verify(&self, stored: &str, password: &str) -> bool {
            stored == format!("plain:{}", password)
        }

        fn calibrate(&self, _budget: Duration) -> u32 {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::PlainScheme;
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn make_store() -> (CredentialStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = CredentialStore::open(dir.path(), Box::new(PlainScheme));
        (store, dir)
    }

    #[test]
    fn first_run_provisions_master() {
        let (store, dir) = make_store();

        let on_disk = crate::props::load(&dir.path().join(USERS_FILE)).unwrap();
        assert_eq!(on_disk.get("master").map(String::as_str), Some(DEFAULT_MASTER));
        assert_eq!(on_disk.get("adminOnly").map(String::as_str), Some("true"));
        assert_eq!(on_disk.get("iterations").map(String::as_str), Some("1"));

        // The provisioned password verifies against the stored hash.
        let provisioned = on_disk[DEFAULT_MASTER]
            .strip_prefix("plain:")
            .unwrap()
            .to_string();
        assert_eq!(provisioned.len(), PROVISIONED_PASSWORD_LENGTH);
        assert!(store.verify(DEFAULT_MASTER, &provisioned));
        assert!(store.is_master(DEFAULT_MASTER));
        assert!(store.is_admin(DEFAULT_MASTER));
    }

    #[test]
    fn reserved_keys_are_never_usernames() {
        let (store, _dir) = make_store();

        for key in RESERVED_KEYS {
            assert!(!store.add_user(key, "x"), "{key} must be rejected");
            assert!(!store.is_admin(key));
            assert!(!store.verify(key, "x"));
        }
        assert!(!store.add_admin("admin", DEFAULT_MASTER));
        assert!(!store.change_password_by_master(DEFAULT_MASTER, "adminOnly", "x"));
    }

    #[test]
    fn add_remove_user() {
        let (store, _dir) = make_store();

        assert!(store.add_user("alice", "secret"));
        assert!(!store.add_user("alice", "other"), "duplicate rejected");
        assert!(store.verify("alice", "secret"));
        assert!(!store.verify("alice", "wrong"));
        assert_eq!(store.usernames(), vec!["alice", DEFAULT_MASTER]);

        assert!(store.remove_user("alice"));
        assert!(!store.remove_user("alice"), "absent rejected");
        assert!(!store.verify("alice", "secret"));
    }

    #[test]
    fn admin_appointment_requires_master() {
        let (store, _dir) = make_store();
        store.add_user("alice", "x");
        store.add_user("bob", "x");

        assert!(!store.add_admin("bob", "alice"), "non-master cannot appoint");
        assert!(store.add_admin("bob", DEFAULT_MASTER));
        assert!(!store.add_admin("bob", DEFAULT_MASTER), "already admin");
        assert!(store.is_admin("bob"));
        assert!(!store.is_master("bob"));

        assert!(!store.remove_admin("bob", "alice"));
        assert!(store.remove_admin("bob", DEFAULT_MASTER));
        assert!(!store.remove_admin("bob", DEFAULT_MASTER), "not an admin");
        assert!(!store.is_admin("bob"));
    }

    #[test]
    fn remove_user_strips_admin_membership() {
        let (store, dir) = make_store();
        store.add_user("alice", "x");
        store.add_admin("alice", DEFAULT_MASTER);
        assert!(store.is_admin("alice"));

        store.remove_user("alice");
        assert!(!store.is_admin("alice"));

        let on_disk = crate::props::load(&dir.path().join(USERS_FILE)).unwrap();
        assert_eq!(on_disk.get("admin").map(String::as_str), Some(""));
    }

    #[test]
    fn toggle_admin_only() {
        let (store, _dir) = make_store();
        assert!(store.is_admin_only(), "defaults to enabled");
        assert!(!store.toggle_admin_only());
        assert!(!store.is_admin_only());
        assert!(store.toggle_admin_only());
    }

    #[test]
    fn password_changes() {
        let (store, _dir) = make_store();
        store.add_user("alice", "old");

        assert!(!store.change_password_self("alice", "wrong", "new"));
        assert!(store.verify("alice", "old"));

        assert!(store.change_password_self("alice", "old", "new"));
        assert!(store.verify("alice", "new"));
        assert!(!store.verify("alice", "old"));

        assert!(!store.change_password_by_master("alice", "alice", "x"));
        assert!(!store.change_password_by_master(DEFAULT_MASTER, "nobody", "x"));
        assert!(store.change_password_by_master(DEFAULT_MASTER, "alice", "issued"));
        assert!(store.verify("alice", "issued"));
    }

    #[test]
    fn reload_is_debounced() {
        let (store, dir) = make_store();
        let path = dir.path().join(USERS_FILE);

        let mut map = crate::props::load(&path).unwrap();
        map.insert("outsider".to_string(), "plain:pw".to_string());
        crate::props::save(&path, &map).unwrap();

        store.reload();
        assert!(!store.verify("outsider", "pw"), "reload inside cool-down");

        store.rewind_cooldown();
        store.reload();
        assert!(store.verify("outsider", "pw"));
    }

    #[test]
    fn argon2_scheme_round_trip() {
        let scheme = Argon2Scheme { memory_kib: 8 };
        let hash = scheme.hash("hunter2", 1).unwrap();
        assert!(scheme.verify(&hash, "hunter2"));
        assert!(!scheme.verify(&hash, "hunter3"));
        assert!(!scheme.verify("not-a-phc-string", "hunter2"));
    }
}
