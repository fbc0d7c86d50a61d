//! Line-based key→value persistence shared by the credential and session
//! stores. One `key=value` pair per line; `#` starts a comment; multi-valued
//! keys hold a backtick-delimited list.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// Delimiter for multi-valued keys (the `admin` list, session records).
pub const LIST_DELIMITER: char = '`';

/// Read a properties file into a map. A missing file is an empty store, not
/// an error. Malformed lines are skipped with a warning.
pub fn load(path: &Path) -> io::Result<BTreeMap<String, String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e),
    };

    let mut map = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                map.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                tracing::warn!("Skipping malformed line in {}: {}", path.display(), line);
            }
        }
    }
    Ok(map)
}

/// Write the map back as `key=value` lines in key order.
pub fn save(path: &Path, map: &BTreeMap<String, String>) -> io::Result<()> {
    let mut out = String::new();
    for (key, value) in map {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    std::fs::write(path, out)
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(LIST_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_list(items: &[String]) -> String {
    items.join(&LIST_DELIMITER.to_string())
}
