//! Immutable, reference-counted handle to one on-disk article.
//!
//! An [`Article`] is an `Arc<ArticleInner>`; ordinary `Arc` strong-count
//! tracking *is* the reference count described in the data model, matching
//! the "shared-ownership smart handle ... keyed on message-id" recommendation.
//! The [`ArticleTable`] holds only weak entries so a fully-dereferenced
//! Article disappears from the interning table on its own.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const MAX_MESSAGE_ID_LEN: usize = 250;

/// A validated `<...>` message-id, cheaply cloneable.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct MessageId(Arc<str>);

impl MessageId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() > MAX_MESSAGE_ID_LEN || !raw.starts_with('<') || !raw.ends_with('>') {
            return Err(Error::BadMessageId(raw.to_owned()));
        }
        Ok(Self(Arc::from(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// External collaborator turning a filename into article body bytes. Kept
/// narrow and behind a trait so Connection/Peer/Tape never depend on a
/// concrete spool layout (spec.md's article-body reader is out of scope for
/// the core and is just an interface here).
pub trait ArticleSource: Send + Sync {
    fn read_body(&self, filename: &Path) -> std::io::Result<Vec<u8>>;
}

/// Reads articles straight off disk, optionally under a spool root and
/// optionally via memory-mapping (`-M` disables the latter).
pub struct FilesystemArticleSource {
    pub spool_root: Option<PathBuf>,
    pub use_mmap: bool,
}

impl FilesystemArticleSource {
    pub fn new(spool_root: Option<PathBuf>, use_mmap: bool) -> Self {
        Self {
            spool_root,
            use_mmap,
        }
    }

    fn resolve(&self, filename: &Path) -> PathBuf {
        if filename.is_absolute() {
            return filename.to_path_buf();
        }
        match &self.spool_root {
            Some(root) => root.join(filename),
            None => filename.to_path_buf(),
        }
    }
}

impl ArticleSource for FilesystemArticleSource {
    fn read_body(&self, filename: &Path) -> std::io::Result<Vec<u8>> {
        let path = self.resolve(filename);
        let meta = std::fs::metadata(&path)?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        if self.use_mmap {
            let file = std::fs::File::open(&path)?;
            // SAFETY: the spool is not expected to be concurrently truncated
            // out from under us; a failure here just falls back to a copy.
            match unsafe { memmap2::Mmap::map(&file) } {
                Ok(map) => Ok(map.to_vec()),
                Err(_) => std::fs::read(&path),
            }
        } else {
            std::fs::read(&path)
        }
    }
}

#[derive(Default)]
struct ArticleState {
    wire: Option<Arc<[u8]>>,
    bad: bool,
    chars_per_line: f64,
}

pub struct ArticleInner {
    pub filename: PathBuf,
    pub message_id: MessageId,
    state: Mutex<ArticleState>,
}

/// Shared handle to one article. Cloning bumps the `Arc` strong count, which
/// is the article's reference count (spec.md §3/§9).
pub type Article = Arc<ArticleInner>;

impl ArticleInner {
    fn new(filename: PathBuf, message_id: MessageId) -> Self {
        Self {
            filename,
            message_id,
            state: Mutex::new(ArticleState {
                chars_per_line: 60.0, // CHARS_PER_LINE default
                ..Default::default()
            }),
        }
    }

    /// True if a previous read marked this article permanently unreadable.
    pub fn is_bad(&self) -> bool {
        self.state.lock().bad
    }

    /// Lazily builds (or returns the cached) dot-stuffed, CR-LF terminated
    /// wire-format buffer. Registers the buffer with `cache` so the
    /// process-wide byte cap can later evict it.
    pub fn wire_format(
        self: &Arc<Self>,
        source: &dyn ArticleSource,
        cache: &WireCache,
    ) -> Result<Arc<[u8]>> {
        {
            let st = self.state.lock();
            if let Some(buf) = &st.wire {
                return Ok(buf.clone());
            }
            if st.bad {
                return Err(Error::ArticleMissing {
                    msgid: self.message_id.clone(),
                    path: self.filename.clone(),
                });
            }
        }

        let raw = match source.read_body(&self.filename) {
            Ok(b) if !b.is_empty() => b,
            _ => {
                self.state.lock().bad = true;
                return Err(Error::ArticleMissing {
                    msgid: self.message_id.clone(),
                    path: self.filename.clone(),
                });
            }
        };

        let mut st = self.state.lock();
        let wire = prepare_wire_format(&raw, &mut st.chars_per_line);
        let arc: Arc<[u8]> = Arc::from(wire.into_boxed_slice());
        st.wire = Some(arc.clone());
        let len = arc.len();
        drop(st);

        cache.register_strong(self, len);
        Ok(arc)
    }

    /// Drops the cached wire-format buffer, returning the number of bytes
    /// freed. Called by the [`WireCache`] on eviction; a no-op (returns 0)
    /// if nothing is currently cached.
    pub fn release_wire_format(&self) -> usize {
        let mut st = self.state.lock();
        st.wire.take().map(|b| b.len()).unwrap_or(0)
    }
}

/// Detects an article body that already looks wire-formatted (a `\r` before
/// the first `\n`), in which case it is passed through uncopied.
fn looks_like_wire_format(raw: &[u8]) -> bool {
    match raw.iter().position(|&b| b == b'\n') {
        Some(pos) => raw[..pos].contains(&b'\r'),
        None => false,
    }
}

fn prepare_wire_format(raw: &[u8], chars_per_line: &mut f64) -> Vec<u8> {
    if looks_like_wire_format(raw) {
        return raw.to_vec();
    }

    let mut lines: Vec<&[u8]> = raw.split(|&b| b == b'\n').collect();
    if matches!(lines.last(), Some(l) if l.is_empty()) {
        lines.pop();
    }

    let est_per_line = (*chars_per_line as usize).max(1);
    let mut out = Vec::with_capacity(raw.len() + raw.len() / est_per_line + 16);
    for line in &lines {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");

    if !lines.is_empty() {
        let avg = raw.len() as f64 / lines.len() as f64;
        *chars_per_line = *chars_per_line * 0.9 + avg * 0.1;
    }
    out
}

/// Keyed on message-id, holding weak entries only: an Article disappears on
/// its own once the last strong reference is dropped. Mirrors
/// `DashMap<PeerHandle, Peer>` from the teacher's peer table.
pub struct ArticleTable {
    by_id: DashMap<MessageId, Weak<ArticleInner>>,
}

impl Default for ArticleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ArticleTable {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
        }
    }

    /// Returns the already-live Article for this message-id if one exists,
    /// otherwise constructs and interns a new one.
    pub fn intern(&self, filename: PathBuf, message_id: MessageId) -> Article {
        if let Some(existing) = self.by_id.get(&message_id) {
            if let Some(strong) = existing.upgrade() {
                return strong;
            }
        }
        let article = Arc::new(ArticleInner::new(filename, message_id.clone()));
        self.by_id.insert(message_id, Arc::downgrade(&article));
        article
    }

    pub fn get(&self, message_id: &MessageId) -> Option<Article> {
        self.by_id.get(message_id).and_then(|w| w.upgrade())
    }

    /// Removes interning-table entries whose Article has already been fully
    /// dropped. Not required for correctness (dead weaks are harmless) but
    /// keeps the table from growing without bound.
    pub fn sweep(&self) {
        self.by_id.retain(|_, w| w.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Process-wide cap on bytes resident in wire-format buffers. Evicts the
/// least-recently-registered Article's buffer (not the Article itself) when
/// registering a new buffer would push total usage over the cap.
pub struct WireCache {
    cap_bytes: usize,
    inner: Mutex<WireCacheInner>,
}

struct WireCacheInner {
    entries: VecDeque<Weak<ArticleInner>>,
    bytes: usize,
}

impl WireCache {
    pub fn new(cap_bytes: usize) -> Self {
        Self {
            cap_bytes,
            inner: Mutex::new(WireCacheInner {
                entries: VecDeque::new(),
                bytes: 0,
            }),
        }
    }

    pub fn bytes_resident(&self) -> usize {
        self.inner.lock().bytes
    }

    fn register_strong(&self, article: &Arc<ArticleInner>, len: usize) {
        let mut inner = self.inner.lock();
        inner.entries.push_back(Arc::downgrade(article));
        inner.bytes += len;
        while inner.bytes > self.cap_bytes {
            let Some(weak) = inner.entries.pop_front() else {
                break;
            };
            if let Some(strong) = weak.upgrade() {
                let freed = strong.release_wire_format();
                inner.bytes = inner.bytes.saturating_sub(freed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_validation() {
        assert!(MessageId::parse("<abc@def>").is_ok());
        assert!(MessageId::parse("abc@def").is_err());
        assert!(MessageId::parse("<abc@def").is_err());
        let too_long = format!("<{}>", "a".repeat(300));
        assert!(MessageId::parse(&too_long).is_err());
    }

    #[test]
    fn wire_format_dot_stuffing() {
        let mut cpl = 60.0;
        let body = b"line one\n.stuffed\nlast line";
        let wire = prepare_wire_format(body, &mut cpl);
        assert_eq!(wire, b"line one\r\n..stuffed\r\nlast line\r\n.\r\n".to_vec());
    }

    #[test]
    fn already_wire_format_passthrough() {
        let mut cpl = 60.0;
        let body = b"line one\r\nline two\r\n";
        let wire = prepare_wire_format(body, &mut cpl);
        assert_eq!(wire, body.to_vec());
    }

    #[test]
    fn interning_reuses_live_article() {
        let table = ArticleTable::new();
        let id = MessageId::parse("<one@test>").unwrap();
        let a1 = table.intern(PathBuf::from("a"), id.clone());
        let a2 = table.intern(PathBuf::from("a"), id.clone());
        assert!(Arc::ptr_eq(&a1, &a2));
        drop(a1);
        drop(a2);
        table.sweep();
        assert_eq!(table.len(), 0);
    }
}
