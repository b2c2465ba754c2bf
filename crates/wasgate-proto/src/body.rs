//! Request body parsing: url-encoded forms, JSON, and multipart/form-data
//! with temp-file uploads.
//!
//! [`parse_form_body`] dispatches on the request's Content-Type and merges
//! the results into the request's params object; multipart file parts are
//! spooled to `fcgi_upload_XXXXXX` temp files under the configured upload
//! directory and described by entries in the files array.

use std::collections::hash_map::RandomState;
use std::fs::OpenOptions;
use std::hash::{BuildHasher, Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use wasgate_core::Value;

use crate::http::parse_query_string;

/// Dispatches body parsing on `content_type`. Parsed fields merge into
/// `params`; multipart uploads append to `files`. Unknown content types are
/// left untouched for the handler.
pub fn parse_form_body(
    content_type: &str,
    body: &[u8],
    upload_tmp_dir: &str,
    params: &mut Value,
    files: &mut Value,
) {
    let lowered = content_type.to_ascii_lowercase();
    if lowered.contains("application/json") {
        parse_json_body(body, params);
    } else if lowered.contains("application/x-www-form-urlencoded") {
        parse_urlencoded_body(body, params);
    } else if lowered.contains("multipart/form-data") {
        if let Some(boundary) = extract_boundary(content_type) {
            parse_multipart(body, &boundary, upload_tmp_dir, params, files);
        }
    }
}

/// Parses an url-encoded body into params.
pub fn parse_urlencoded_body(body: &[u8], params: &mut Value) {
    let text = String::from_utf8_lossy(body);
    for (key, value) in parse_query_string(&text) {
        params.insert(key, value);
    }
}

/// Parses a JSON body. Objects merge key-by-key into params; any other
/// JSON value lands under `_json`; parse failures record the position
/// under `_json_error`.
pub fn parse_json_body(body: &[u8], params: &mut Value) {
    let text = String::from_utf8_lossy(body);
    match Value::from_json(&text) {
        Ok(Value::Object(map)) => {
            for (key, value) in map {
                params.insert(key, value);
            }
        }
        Ok(other) => params.insert("_json", other),
        Err(pos) => params.insert("_json_error", format!("parse error at position {pos}")),
    }
}

/// Pulls the boundary token out of a multipart Content-Type, unquoting if
/// necessary.
#[must_use]
pub fn extract_boundary(content_type: &str) -> Option<String> {
    let lowered = content_type.to_ascii_lowercase();
    let start = lowered.find("boundary=")? + "boundary=".len();
    let mut boundary = &content_type[start..];
    if let Some(semi) = boundary.find(';') {
        boundary = &boundary[..semi];
    }
    let boundary = boundary.trim();
    let boundary = boundary.strip_prefix('"').and_then(|b| b.strip_suffix('"')).unwrap_or(boundary);
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Parses a multipart/form-data body. Plain fields merge into `params`;
/// file parts are written to temp files and described in `files` with
/// field_name, filename, content_type, temp_path, size, expected_size, an
/// FNV-1a content hash, and a `partial` flag when the write came up short.
///
/// Returns false when the body does not follow the expected delimiter
/// structure; fields parsed before the malformation are kept.
pub fn parse_multipart(
    body: &[u8],
    boundary: &str,
    upload_dir: &str,
    params: &mut Value,
    files: &mut Value,
) -> bool {
    let delim = format!("--{boundary}").into_bytes();
    let mut pos = 0;

    loop {
        let Some(mut start) = find_subsequence(body, &delim, pos) else {
            break;
        };
        start += delim.len();
        if body[start..].starts_with(b"--") {
            break;
        }
        if body[start..].starts_with(b"\r\n") {
            start += 2;
        } else {
            return false;
        }

        let Some(header_end) = find_subsequence(body, b"\r\n\r\n", start) else {
            return false;
        };
        let headers = &body[start..header_end];
        let content_start = header_end + 4;

        let mut closing = Vec::with_capacity(delim.len() + 2);
        closing.extend_from_slice(b"\r\n");
        closing.extend_from_slice(&delim);
        let Some(part_end) = find_subsequence(body, &closing, content_start) else {
            return false;
        };
        // When the payload itself ends in CRLF the delimiter search lands
        // on the payload's own CRLF rather than the separator, leaving one
        // trailing CRLF inside the slice; trim it off.
        let mut content_end = part_end;
        if content_end - content_start >= 2 && body[content_end - 2..content_end] == *b"\r\n" {
            content_end -= 2;
        }
        let content = &body[content_start..content_end];

        let (field_name, filename, ctype) = parse_part_headers(headers);
        if filename.is_empty() {
            params.insert(field_name, String::from_utf8_lossy(content).into_owned());
        } else if let Some(entry) = spool_upload(&field_name, &filename, &ctype, content, upload_dir) {
            files.push(entry);
        }

        pos = part_end + 2;
    }
    true
}

/// Parses a part's header block into (field name, filename, content type).
fn parse_part_headers(headers: &[u8]) -> (String, String, String) {
    let mut field_name = String::new();
    let mut filename = String::new();
    let mut ctype = String::new();

    let text = String::from_utf8_lossy(headers);
    for line in text.split("\r\n") {
        let Some(colon) = line.find(':') else {
            continue;
        };
        let name = line[..colon].trim().to_ascii_lowercase();
        let value = line[colon + 1..].trim();
        if name == "content-disposition" {
            for attr in value.split(';') {
                let attr = attr.trim();
                let Some(eq) = attr.find('=') else {
                    continue;
                };
                let key = attr[..eq].trim();
                let mut val = attr[eq + 1..].trim();
                if val.len() >= 2 && val.starts_with('"') && val.ends_with('"') {
                    val = &val[1..val.len() - 1];
                }
                match key {
                    "name" => field_name = val.to_string(),
                    "filename" => filename = val.to_string(),
                    _ => {}
                }
            }
        } else if name == "content-type" {
            ctype = value.to_string();
        }
    }
    (field_name, filename, ctype)
}

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Writes one upload to a temp file and builds its files-array entry.
/// Returns `None` when no temp file could be created.
fn spool_upload(
    field_name: &str,
    filename: &str,
    ctype: &str,
    content: &[u8],
    upload_dir: &str,
) -> Option<Value> {
    let (mut file, path) = create_upload_temp(Path::new(upload_dir)).ok()?;

    let mut written = 0usize;
    while written < content.len() {
        match file.write(&content[written..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => written += n,
        }
    }

    let mut entry = Value::object();
    entry.insert("field_name", field_name);
    entry.insert("filename", filename);
    if !ctype.is_empty() {
        entry.insert("content_type", ctype);
    }
    entry.insert("temp_path", path.to_string_lossy().into_owned());
    entry.insert("size", written);
    entry.insert("expected_size", content.len());
    entry.insert("hash_fnv1a64", format!("{:016x}", fnv1a64(content)));
    if written != content.len() {
        entry.insert("partial", true);
    }
    Some(entry)
}

static UPLOAD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Creates an exclusive `fcgi_upload_XXXXXX` temp file under `dir`,
/// retrying with fresh suffixes on collision (mkstemp semantics).
fn create_upload_temp(dir: &Path) -> std::io::Result<(std::fs::File, PathBuf)> {
    const SUFFIX_CHARS: &[u8; 62] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let state = RandomState::new();

    for _ in 0..64 {
        let mut hasher = state.build_hasher();
        UPLOAD_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
        std::time::SystemTime::now().hash(&mut hasher);
        let mut seed = hasher.finish();

        let mut suffix = String::with_capacity(6);
        for _ in 0..6 {
            suffix.push(SUFFIX_CHARS[(seed % 62) as usize] as char);
            seed /= 62;
        }

        let path = dir.join(format!("fcgi_upload_{suffix}"));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "exhausted upload temp name attempts",
    ))
}
