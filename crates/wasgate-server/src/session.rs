//! On-disk session store.
//!
//! Sessions are JSON files named `<id>.json` under the configured storage
//! directory. Ids are 32 hex characters. `start` adopts the id from the
//! request's session cookie (set by the caller) or mints a fresh one and
//! emits a `Set-Cookie` response header.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use wasgate_core::config::GatewayConfig;
use wasgate_core::request::RequestData;
use wasgate_core::Value;

use crate::file_cache::FileCache;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generates a 32-character hex session id.
#[must_use]
pub fn generate_id() -> String {
    let state = RandomState::new();
    let mut out = String::with_capacity(32);
    while out.len() < 32 {
        let mut hasher = state.build_hasher();
        ID_COUNTER.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
        std::time::SystemTime::now().hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        let mut v = hasher.finish();
        for _ in 0..8 {
            if out.len() == 32 {
                break;
            }
            out.push(char::from_digit((v & 0xF) as u32, 16).unwrap_or('0'));
            v >>= 4;
        }
    }
    out
}

/// Store for session files.
pub struct SessionStore {
    dir: PathBuf,
    cache: Arc<FileCache>,
}

impl SessionStore {
    /// Creates a store rooted at `dir`, reading through the file cache.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, cache: Arc<FileCache>) -> Self {
        Self {
            dir: dir.into(),
            cache,
        }
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Ensures the request has a session id, minting one if absent.
    pub fn ensure_id(&self, data: &mut RequestData) -> String {
        if data.session_id.is_empty() {
            data.session_id = generate_id();
        }
        data.session_id.clone()
    }

    /// Starts the session: adopts or mints the id, emits the session
    /// cookie when the request did not present one, and loads stored data
    /// (or an empty object).
    pub fn start(&self, data: &mut RequestData, config: &GatewayConfig) {
        self.ensure_id(data);
        if data.cookies.find(&config.session_cookie_name).is_none() {
            data.headers.insert(
                "Set-Cookie",
                format!(
                    "{}={}; Path={}; HttpOnly",
                    config.session_cookie_name, data.session_id, config.session_cookie_path
                ),
            );
        }
        if !self.load(data) {
            data.session = Value::object();
        }
    }

    /// Loads session data for the request's id. Returns false when there
    /// is no id, no file, or the file is not valid JSON.
    pub fn load(&self, data: &mut RequestData) -> bool {
        if data.session_id.is_empty() {
            return false;
        }
        let path = self.session_path(&data.session_id);
        let Some(content) = self.cache.read(&path.to_string_lossy()) else {
            return false;
        };
        match Value::from_json(&content) {
            Ok(value) => {
                data.session = value;
                true
            }
            Err(_) => false,
        }
    }

    /// Persists the request's session data. Returns false when the request
    /// has no session id or the write fails.
    pub fn save(&self, data: &RequestData) -> bool {
        if data.session_id.is_empty() {
            return false;
        }
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            wasgate_core::log_error!("session dir {}: {e}", self.dir.display());
            return false;
        }
        let path = self.session_path(&data.session_id);
        let content = data.session.to_json();
        match self.cache.write(&path.to_string_lossy(), &content) {
            Ok(()) => true,
            Err(e) => {
                wasgate_core::log_error!("session save {}: {e}", path.display());
                false
            }
        }
    }

    /// Deletes the session file and resets the request's session state.
    pub fn clear(&self, data: &mut RequestData) {
        if !data.session_id.is_empty() {
            let _ = std::fs::remove_file(self.session_path(&data.session_id));
        }
        data.session_id.clear();
        data.session = Value::object();
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").field("dir", &self.dir).finish_non_exhaustive()
    }
}
