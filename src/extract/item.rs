//! Work items and the sources they are pulled from.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use walkdir::WalkDir;

use super::persistence::path_bytes;

const FILE_SCHEME: &str = "file://";

/// Shared flag the upstream caller flips to abandon an item.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One file queued for metadata extraction.
#[derive(Debug, Clone)]
pub struct ExtractionItem {
    uri: String,
    path: Option<PathBuf>,
    mime: Option<String>,
    cancel: CancelToken,
}

impl ExtractionItem {
    /// Item for a local file.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            uri: file_uri(&path),
            path: Some(path),
            mime: None,
            cancel: CancelToken::new(),
        }
    }

    /// Item for an arbitrary URI. Only `file://` URIs have a local path.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let path = uri
            .strip_prefix(FILE_SCHEME)
            .filter(|rest| rest.starts_with('/'))
            .map(decode_path);
        Self {
            uri,
            path,
            mime: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Local file behind this item; `None` for virtual entries.
    pub fn local_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// `file://` URI for `path`. Each segment's raw bytes are percent-encoded,
/// so distinct paths never share a URI.
fn file_uri(path: &Path) -> String {
    let bytes = path_bytes(path);
    let segments: Vec<String> = bytes
        .split(|b| *b == b'/')
        .map(|segment| urlencoding::encode_binary(segment).into_owned())
        .collect();
    format!("{FILE_SCHEME}{}", segments.join("/"))
}

#[cfg(unix)]
fn decode_path(encoded: &str) -> PathBuf {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;

    let bytes = urlencoding::decode_binary(encoded.as_bytes()).into_owned();
    PathBuf::from(OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn decode_path(encoded: &str) -> PathBuf {
    let bytes = urlencoding::decode_binary(encoded.as_bytes());
    PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
}

/// Outcome of asking a source for work.
#[derive(Debug)]
pub enum Pull {
    Item(ExtractionItem),
    /// Nothing left right now; not an error.
    Exhausted,
    /// The source is suspended.
    Paused,
}

/// Upstream supplier of extraction work.
pub trait ItemSource: Send {
    fn pull_next(&mut self) -> Pull;
}

impl ItemSource for VecDeque<ExtractionItem> {
    fn pull_next(&mut self) -> Pull {
        match self.pop_front() {
            Some(item) => Pull::Item(item),
            None => Pull::Exhausted,
        }
    }
}

type SkipFn = Box<dyn Fn(&Path) -> bool + Send>;

/// Walks directory trees lazily, yielding every regular file.
pub struct CrawlSource {
    pending_roots: VecDeque<PathBuf>,
    walker: Option<walkdir::IntoIter>,
    skip: Option<SkipFn>,
    skipped: usize,
}

impl CrawlSource {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            pending_roots: roots.into_iter().collect(),
            walker: None,
            skip: None,
            skipped: 0,
        }
    }

    /// Leave out files for which `skip` returns true, e.g. ones already
    /// extracted.
    pub fn skip_if<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + 'static,
    {
        self.skip = Some(Box::new(skip));
        self
    }

    /// Files passed over by the skip predicate so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn next_file(&mut self) -> Option<PathBuf> {
        loop {
            if self.walker.is_none() {
                let root = self.pending_roots.pop_front()?;
                crate::debug_event!("crawl", "root", "{}", root.display());
                self.walker = Some(WalkDir::new(root).follow_links(false).into_iter());
            }

            let walker = self.walker.as_mut()?;
            match walker.next() {
                None => self.walker = None,
                Some(Err(e)) => tracing::warn!("[crawl] {e}"),
                Some(Ok(entry)) if entry.file_type().is_file() => {
                    let path = entry.into_path();
                    if self.skip.as_ref().is_some_and(|skip| skip(&path)) {
                        self.skipped += 1;
                        continue;
                    }
                    return Some(path);
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

impl ItemSource for CrawlSource {
    fn pull_next(&mut self) -> Pull {
        match self.next_file() {
            Some(path) => Pull::Item(ExtractionItem::from_path(path)),
            None => Pull::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn drain(source: &mut impl ItemSource) -> Vec<PathBuf> {
        let mut found = Vec::new();
        while let Pull::Item(item) = source.pull_next() {
            found.push(item.local_path().unwrap().to_path_buf());
        }
        found.sort();
        found
    }

    #[test]
    fn test_uri_local_path() {
        let local = ExtractionItem::from_uri("file:///data/a.txt");
        assert_eq!(local.local_path(), Some(Path::new("/data/a.txt")));

        let remote = ExtractionItem::from_uri("http://example.com/a.txt");
        assert_eq!(remote.local_path(), None);

        let item = ExtractionItem::from_path("/data/b.txt");
        assert_eq!(item.uri(), "file:///data/b.txt");
    }

    #[test]
    fn test_uri_escapes_reserved_bytes() {
        let item = ExtractionItem::from_path("/data/my notes/50%#1.txt");
        assert_eq!(item.uri(), "file:///data/my%20notes/50%25%231.txt");

        let back = ExtractionItem::from_uri(item.uri());
        assert_eq!(back.local_path(), Some(Path::new("/data/my notes/50%#1.txt")));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_get_distinct_uris() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let first = Path::new(OsStr::from_bytes(b"/data/caf\xe9.txt"));
        let second = Path::new(OsStr::from_bytes(b"/data/caf\xe8.txt"));

        let a = ExtractionItem::from_path(first);
        let b = ExtractionItem::from_path(second);
        assert_ne!(a.uri(), b.uri());
        assert_eq!(a.uri(), "file:///data/caf%E9.txt");
        assert_eq!(ExtractionItem::from_uri(a.uri()).local_path(), Some(first));
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let item = ExtractionItem::from_path("/data/a.txt").with_cancel(token.clone());

        token.cancel();
        assert!(item.cancel_token().is_cancelled());
    }

    #[test]
    fn test_crawl_walks_all_roots() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        fs::create_dir_all(a.join("nested")).unwrap();
        fs::create_dir_all(&b).unwrap();
        fs::write(a.join("one.txt"), "1").unwrap();
        fs::write(a.join("nested/two.txt"), "2").unwrap();
        fs::write(b.join("three.txt"), "3").unwrap();

        let mut source = CrawlSource::new([a.clone(), b.clone()]);
        let found = drain(&mut source);

        assert_eq!(
            found,
            vec![a.join("nested/two.txt"), a.join("one.txt"), b.join("three.txt")]
        );
        assert!(matches!(source.pull_next(), Pull::Exhausted));
    }

    #[test]
    fn test_crawl_skip_predicate() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("keep.txt"), "k").unwrap();
        fs::write(temp.path().join("done.txt"), "d").unwrap();

        let mut source = CrawlSource::new([temp.path().to_path_buf()])
            .skip_if(|path| path.ends_with("done.txt"));
        let found = drain(&mut source);

        assert_eq!(found, vec![temp.path().join("keep.txt")]);
        assert_eq!(source.skipped(), 1);
    }
}
