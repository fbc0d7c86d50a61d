//! Server configuration, read once at startup from `configuration.properties`
//! in the content root. Missing keys are written back with their defaults so
//! the file documents itself. The resulting value is immutable; components
//! receive it behind an `Arc` and never change it.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::props;

pub const CONFIG_FILE: &str = "configuration.properties";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Display name shown in the navbar brand.
    pub server_name: String,
    /// Label on the folder dropdown in the navbar.
    pub dropdown_name: String,
    pub host: String,
    pub port: u16,
    /// Where `GET /` redirects; `/` or empty means no redirect.
    pub root_redirect: String,
    /// Whether to run the change watcher.
    pub live_reload: bool,
    /// Session lifetime; also the `login-id` cookie max-age.
    pub cookie_age: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_name: "Markdown Server".to_string(),
            dropdown_name: "Folders".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1278,
            root_redirect: "/".to_string(),
            live_reload: true,
            cookie_age: Duration::from_secs(2_592_000),
        }
    }
}

impl ServerConfig {
    /// Load the configuration from `dir`, filling in and persisting defaults
    /// for any missing key. A file that cannot be read or written is logged
    /// and the defaults are used as-is.
    pub fn load(dir: &Path) -> ServerConfig {
        let path = dir.join(CONFIG_FILE);
        let mut map = match props::load(&path) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!("Cannot read {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        let defaults = ServerConfig::default();
        let mut altered = false;
        let mut set_default = |map: &mut BTreeMap<String, String>, key: &str, value: String| {
            if !map.contains_key(key) {
                map.insert(key.to_string(), value);
                altered = true;
            }
        };

        set_default(&mut map, "servername", defaults.server_name.clone());
        set_default(&mut map, "dropdownName", defaults.dropdown_name.clone());
        set_default(&mut map, "host", defaults.host.clone());
        set_default(&mut map, "port", defaults.port.to_string());
        set_default(&mut map, "root", defaults.root_redirect.clone());
        set_default(&mut map, "liveReload", defaults.live_reload.to_string());
        set_default(
            &mut map,
            "cookieAge",
            defaults.cookie_age.as_secs().to_string(),
        );

        if altered {
            if let Err(e) = props::save(&path, &map) {
                tracing::error!("Cannot write {}: {}", path.display(), e);
            }
        }

        ServerConfig {
            server_name: map["servername"].clone(),
            dropdown_name: map["dropdownName"].clone(),
            host: map["host"].clone(),
            port: parse_or(&map, "port", defaults.port),
            root_redirect: map["root"].clone(),
            live_reload: parse_or(&map, "liveReload", defaults.live_reload),
            cookie_age: Duration::from_secs(parse_or(
                &map,
                "cookieAge",
                defaults.cookie_age.as_secs(),
            )),
        }
    }

    /// True when `GET /` should redirect instead of resolving content.
    pub fn has_root_redirect(&self) -> bool {
        !self.root_redirect.is_empty() && self.root_redirect != "/"
    }
}

fn parse_or<T: FromStr + Copy>(map: &BTreeMap<String, String>, key: &str, default: T) -> T {
    match map[key].parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("Invalid value for {}: {:?}, using default", key, map[key]);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_defaults_on_first_load() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::load(dir.path());

        assert_eq!(config.port, 1278);
        assert_eq!(config.server_name, "Markdown Server");
        assert!(config.live_reload);

        let written = props::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(written.get("port").map(String::as_str), Some("1278"));
        assert_eq!(written.get("cookieAge").map(String::as_str), Some("2592000"));
    }

    #[test]
    fn keeps_existing_values() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "port=8080\nservername=Notes\nroot=/index\n",
        )
        .unwrap();

        let config = ServerConfig::load(dir.path());
        assert_eq!(config.port, 8080);
        assert_eq!(config.server_name, "Notes");
        assert_eq!(config.root_redirect, "/index");
        assert!(config.has_root_redirect());
    }

    #[test]
    fn bad_number_falls_back_to_default() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "port=not-a-number\n").unwrap();

        let config = ServerConfig::load(dir.path());
        assert_eq!(config.port, 1278);
    }

    #[test]
    fn plain_root_is_not_a_redirect() {
        let config = ServerConfig::default();
        assert!(!config.has_root_redirect());
    }
}
