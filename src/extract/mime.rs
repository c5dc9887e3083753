//! MIME type guessing for items that arrive without one.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const DIRECTORY: &str = "inode/directory";

/// How many leading bytes are inspected when the extension is unknown.
const SNIFF_LEN: usize = 512;

/// Guess the MIME type of `path`.
///
/// Returns `None` when the file cannot be inspected at all.
pub fn sniff(path: &Path) -> Option<String> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            crate::debug_event!("extract", "cannot stat", "{}: {e}", path.display());
            return None;
        }
    };

    if metadata.is_dir() {
        return Some(DIRECTORY.to_string());
    }

    if let Some(mime) = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| by_extension(&ext.to_ascii_lowercase()))
    {
        return Some(mime.to_string());
    }

    let mut head = Vec::with_capacity(SNIFF_LEN);
    let read = File::open(path).and_then(|f| f.take(SNIFF_LEN as u64).read_to_end(&mut head));
    if let Err(e) = read {
        crate::debug_event!("extract", "cannot read", "{}: {e}", path.display());
        return None;
    }

    Some(by_content(&head).to_string())
}

fn by_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "rs" => "text/x-rust",
        "c" | "h" => "text/x-c",
        "py" => "text/x-python",
        "toml" => "application/toml",
        "json" => "application/json",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/x-wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "pdf" => "application/pdf",
        "ps" => "application/postscript",
        "zip" => "application/zip",
        _ => return None,
    };
    Some(mime)
}

fn by_content(head: &[u8]) -> &'static str {
    if head.starts_with(b"%PDF-") {
        "application/pdf"
    } else if head.starts_with(b"%!PS") {
        "application/postscript"
    } else if head.starts_with(b"\x89PNG") {
        "image/png"
    } else if head.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if head.starts_with(b"ID3") {
        "audio/mpeg"
    } else if !head.contains(&0) && std::str::from_utf8(head).is_ok() {
        "text/plain"
    } else {
        OCTET_STREAM
    }
}

/// Whether `mime` matches `pattern` (`*`, `type/*` or an exact type).
pub fn matches(pattern: &str, mime: &str) -> bool {
    if pattern == "*" || pattern == mime {
        return true;
    }
    match pattern.strip_suffix("/*") {
        Some(major) => mime
            .split_once('/')
            .is_some_and(|(mime_major, _)| mime_major == major),
        None => false,
    }
}
