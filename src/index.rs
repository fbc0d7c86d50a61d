//! Live content index: maps `.md` files under the content root to URL paths,
//! folder URLs to `.mdIndex` redirects, and keeps a generated navbar dropdown
//! fragment. A rescan walks the whole tree into a fresh snapshot and swaps it
//! atomically, so readers never see a half-built index and stale entries
//! cannot survive a partial diff.

use maud::html;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;

/// Files whose single line names the redirect target for their folder's URL.
const INDEX_MARKER: &str = ".mdIndex";

/// First-level directory reserved for static assets; excluded from the
/// dropdown (and from content URLs — it holds no markdown).
pub const RESOURCES_DIR: &str = "resources";

const CONTENT_EXTENSION: &str = ".md";

/// Sentinel URL for a file that turns out to lie outside the content root.
const ERROR_URL: &str = "/error";

// ── Rendering ────────────────────────────────────────────────────────────────

pub struct RenderedDoc {
    pub title: String,
    pub html: String,
}

/// Pluggable markup renderer: raw document in, title and HTML out.
pub trait Renderer: Send + Sync {
    fn render(&self, raw: &str) -> RenderedDoc;
}

/// Default renderer: GFM markdown, title from the first heading line.
pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn render(&self, raw: &str) -> RenderedDoc {
        let title = raw
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.trim_start_matches('#').trim().to_string())
            .unwrap_or_default();

        let mut opts = markdown::Options::gfm();
        opts.compile.allow_dangerous_html = true;
        let html =
            markdown::to_html_with_options(raw, &opts).unwrap_or_else(|_| markdown::to_html(raw));

        RenderedDoc { title, html }
    }
}

// ── Entries ──────────────────────────────────────────────────────────────────

pub struct ContentEntry {
    pub abs_path: PathBuf,
    pub url: String,
    rendered: OnceCell<RenderedDoc>,
}

impl ContentEntry {
    fn new(path: PathBuf, root: &Path) -> ContentEntry {
        let url = match path.strip_prefix(root) {
            Ok(rel) => {
                let url = normalized_url(rel);
                url.strip_suffix(CONTENT_EXTENSION)
                    .map(str::to_string)
                    .unwrap_or(url)
            }
            Err(_) => {
                tracing::error!("{} is not under the content root", path.display());
                ERROR_URL.to_string()
            }
        };
        ContentEntry {
            abs_path: path,
            url,
            rendered: OnceCell::new(),
        }
    }

    /// Read and render the file, at most once per snapshot generation. An
    /// unreadable file renders as an empty document, logged.
    pub async fn rendered(&self, renderer: &dyn Renderer) -> &RenderedDoc {
        self.rendered
            .get_or_init(|| async {
                let raw = match tokio::fs::read_to_string(&self.abs_path).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::error!("Cannot read {}: {}", self.abs_path.display(), e);
                        String::new()
                    }
                };
                renderer.render(&raw)
            })
            .await
    }

    fn depth(&self) -> usize {
        self.url.matches('/').count()
    }
}

/// Lowercase, space-to-hyphen, forward-slash URL for a root-relative path.
fn normalized_url(rel: &Path) -> String {
    let mut url = String::new();
    for segment in rel.iter() {
        url.push('/');
        url.push_str(&segment.to_string_lossy().replace(' ', "-").to_lowercase());
    }
    url
}

// ── Index ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct IndexSnapshot {
    entries: Vec<Arc<ContentEntry>>,
    redirects: std::collections::HashMap<String, String>,
    dropdown: String,
}

pub struct ContentIndex {
    root: PathBuf,
    renderer: Box<dyn Renderer>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
}

impl ContentIndex {
    pub fn new(root: PathBuf, renderer: Box<dyn Renderer>) -> ContentIndex {
        ContentIndex {
            root,
            renderer,
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full recursive walk into a fresh snapshot, swapped in atomically at
    /// the end. Unreadable files and directories are logged and skipped.
    pub fn rescan(&self) {
        tracing::info!("Reloading content from {}", self.root.display());
        let mut next = IndexSnapshot::default();
        scan_dir(&self.root, &self.root, &mut next);
        next.dropdown = build_dropdown(&self.root);
        tracing::info!(
            "Files found: {}; indices: {}",
            next.entries.len(),
            next.redirects.len()
        );
        *self.snapshot.write().unwrap() = Arc::new(next);
    }

    /// Exact-match lookup by URL path.
    pub fn lookup(&self, url: &str) -> Option<Arc<ContentEntry>> {
        self.snapshot
            .read()
            .unwrap()
            .entries
            .iter()
            .find(|entry| entry.url == url)
            .cloned()
    }

    /// Every entry under `prefix`, shallowest first, then lexicographic, so
    /// folder indexes precede their nested content.
    pub fn folder_overview(&self, prefix: &str) -> Vec<Arc<ContentEntry>> {
        let snapshot = self.snapshot.read().unwrap();
        let mut matches: Vec<Arc<ContentEntry>> = snapshot
            .entries
            .iter()
            .filter(|entry| entry.url.starts_with(prefix))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.url.cmp(&b.url)));
        matches
    }

    pub fn has_redirect(&self, folder_url: &str) -> bool {
        self.snapshot
            .read()
            .unwrap()
            .redirects
            .contains_key(folder_url)
    }

    pub fn redirect_target(&self, folder_url: &str) -> String {
        self.snapshot
            .read()
            .unwrap()
            .redirects
            .get(folder_url)
            .cloned()
            .unwrap_or_else(|| "/".to_string())
    }

    /// The generated navbar dropdown fragment (markup, pre-escaped).
    pub fn dropdown(&self) -> String {
        self.snapshot.read().unwrap().dropdown.clone()
    }

    pub async fn rendered<'a>(&self, entry: &'a ContentEntry) -> &'a RenderedDoc {
        entry.rendered(self.renderer.as_ref()).await
    }
}

fn scan_dir(root: &Path, dir: &Path, snapshot: &mut IndexSnapshot) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot read directory {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Cannot read entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        if path.is_dir() {
            scan_dir(root, &path, snapshot);
        } else if name.ends_with(CONTENT_EXTENSION) {
            snapshot
                .entries
                .push(Arc::new(ContentEntry::new(path, root)));
        } else if name == INDEX_MARKER {
            match read_redirect_target(&path) {
                Some(target) => {
                    let mut folder_url = path
                        .parent()
                        .and_then(|parent| parent.strip_prefix(root).ok())
                        .map(normalized_url)
                        .unwrap_or_default();
                    if folder_url.is_empty() {
                        folder_url = "/".to_string();
                    }
                    snapshot.redirects.insert(folder_url, target);
                }
                None => tracing::error!("Cannot read index marker at {}", path.display()),
            }
        }
    }
}

/// The marker file's first line is the redirect target.
fn read_redirect_target(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let line = raw.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }
    Some(line.to_string())
}

/// Links to all first-level subdirectories, excluding the static-asset
/// directory and hidden directories.
fn build_dropdown(root: &Path) -> String {
    let mut folders: Vec<String> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || name == RESOURCES_DIR || name.starts_with('.') {
                continue;
            }
            folders.push(name);
        }
    }
    folders.sort();

    html! {
        @for name in &folders {
            a.dropdown-item href=(format!("/{}", name.replace(' ', "-").to_lowercase())) {
                (name)
            }
        }
    }
    .into_string()
}
