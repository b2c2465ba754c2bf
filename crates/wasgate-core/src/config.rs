//! Gateway configuration.
//!
//! [`GatewayConfig`] carries every tunable the gateway consumes: listener
//! addresses, arena sizing, per-request caps, upload and session policy,
//! logging, and shutdown budgets. It can be built programmatically with the
//! `with_*` setters or populated from `--flag value` command-line arguments.
//!
//! A small KV file loader lives here as well; endpoint context files use it.

use crate::value::Value;

/// Default FastCGI TCP port.
pub const DEFAULT_FCGI_PORT: u16 = 9000;

/// Default WebSocket TCP port.
pub const DEFAULT_WS_PORT: u16 = 9001;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 4096;

/// Default concurrent-request ceiling (and arena count).
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 64;

/// Default per-arena capacity in bytes.
pub const DEFAULT_ARENA_CAPACITY: usize = 256 * 1024;

/// Configuration for the gateway. Field meanings follow the runtime
/// behavior documented on each accessor group.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// FastCGI TCP port (ignored when `fcgi_socket_path` is set).
    pub fcgi_port: u16,
    /// FastCGI UNIX socket path; empty means TCP.
    pub fcgi_socket_path: String,
    /// WebSocket TCP port (ignored when `ws_socket_path` is set).
    pub ws_port: u16,
    /// WebSocket UNIX socket path; empty means TCP.
    pub ws_socket_path: String,
    /// Listen backlog for both listeners.
    pub backlog: i32,

    /// Arena count == concurrent request ceiling.
    pub max_in_flight: u32,
    /// Per-arena capacity in bytes.
    pub arena_capacity: usize,
    /// Worker thread count; 0 means `max_in_flight`.
    pub workers: usize,
    /// Initial reservation for per-connection out-buffers.
    pub output_buffer_initial: usize,

    /// Cumulative PARAMS byte cap per request.
    pub max_params_bytes: usize,
    /// Cumulative STDIN byte cap per request.
    pub max_stdin_bytes: usize,
    /// Request timeout in seconds enforced by housekeeping; 0 disables.
    pub max_request_time: u64,

    /// Parent directory for upload temp files.
    pub upload_tmp_dir: String,
    /// Keep uploaded temp files after the request finishes.
    pub keep_uploaded_files: bool,
    /// Unlink temp files when the request is finalized.
    pub cleanup_temp_on_disconnect: bool,

    /// Env var naming the endpoint context file.
    pub endpoint_file_var: String,
    /// Env var carrying the raw cookie header.
    pub http_cookies_var: String,
    /// Env var carrying the query string.
    pub http_query_var: String,
    /// Content-Type set on responses before the handler runs.
    pub default_content_type: String,

    /// Session cookie name.
    pub session_cookie_name: String,
    /// Session cookie lifetime in seconds.
    pub session_cookie_lifetime: f64,
    /// Session cookie path attribute.
    pub session_cookie_path: String,
    /// Directory holding session JSON files.
    pub session_storage_path: String,
    /// Load the session automatically when the cookie is present.
    pub session_auto_load: bool,

    /// Entry cap per container in the demo dump output; 0 = unlimited.
    pub print_env_limit: usize,
    /// Indent width in the demo dump output.
    pub print_indent: usize,
    /// Body preview cap in the demo dump output.
    pub body_preview_limit: usize,

    /// Log verbosity: 0 error, 1 info, 2 debug, 3 trace.
    pub log_level: u8,
    /// Log sink: "stderr" or a file path.
    pub log_destination: String,

    /// File-cache entry TTL in seconds.
    pub file_cache_ttl: u64,
    /// File-cache total size cap in bytes.
    pub file_cache_max_size: usize,

    /// Post-signal drain budget in milliseconds.
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            fcgi_port: DEFAULT_FCGI_PORT,
            fcgi_socket_path: String::new(),
            ws_port: DEFAULT_WS_PORT,
            ws_socket_path: String::new(),
            backlog: DEFAULT_BACKLOG,

            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            workers: 0,
            output_buffer_initial: 32 * 1024,

            max_params_bytes: 256 * 1024,
            max_stdin_bytes: 2 * 1024 * 1024,
            max_request_time: 0,

            upload_tmp_dir: "/tmp".into(),
            keep_uploaded_files: false,
            cleanup_temp_on_disconnect: true,

            endpoint_file_var: "SCRIPT_FILENAME".into(),
            http_cookies_var: "HTTP_COOKIE".into(),
            http_query_var: "QUERY_STRING".into(),
            default_content_type: "text/plain; charset=utf-8".into(),

            session_cookie_name: "session_id".into(),
            session_cookie_lifetime: 60.0 * 60.0 * 24.0 * 30.0,
            session_cookie_path: "/".into(),
            session_storage_path: "/tmp/sessions".into(),
            session_auto_load: true,

            print_env_limit: 0,
            print_indent: 2,
            body_preview_limit: 1024,

            log_level: 1,
            log_destination: "stderr".into(),

            file_cache_ttl: 60,
            file_cache_max_size: 8 * 1024 * 1024,

            graceful_shutdown_timeout_ms: 5000,
        }
    }
}

impl GatewayConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective worker thread count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            self.max_in_flight as usize
        } else {
            self.workers
        }
    }

    /// Sets the FastCGI TCP port.
    #[must_use]
    pub fn with_fcgi_port(mut self, port: u16) -> Self {
        self.fcgi_port = port;
        self
    }

    /// Sets the FastCGI UNIX socket path.
    #[must_use]
    pub fn with_fcgi_socket_path(mut self, path: impl Into<String>) -> Self {
        self.fcgi_socket_path = path.into();
        self
    }

    /// Sets the WebSocket TCP port.
    #[must_use]
    pub fn with_ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }

    /// Sets the WebSocket UNIX socket path.
    #[must_use]
    pub fn with_ws_socket_path(mut self, path: impl Into<String>) -> Self {
        self.ws_socket_path = path.into();
        self
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the concurrent-request ceiling (arena count).
    #[must_use]
    pub fn with_max_in_flight(mut self, max: u32) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Sets the per-arena capacity.
    #[must_use]
    pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = bytes;
        self
    }

    /// Sets the worker thread count (0 = `max_in_flight`).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the cumulative PARAMS cap.
    #[must_use]
    pub fn with_max_params_bytes(mut self, bytes: usize) -> Self {
        self.max_params_bytes = bytes;
        self
    }

    /// Sets the cumulative STDIN cap.
    #[must_use]
    pub fn with_max_stdin_bytes(mut self, bytes: usize) -> Self {
        self.max_stdin_bytes = bytes;
        self
    }

    /// Sets the housekeeping request timeout in seconds (0 disables).
    #[must_use]
    pub fn with_max_request_time(mut self, secs: u64) -> Self {
        self.max_request_time = secs;
        self
    }

    /// Sets the upload temp directory.
    #[must_use]
    pub fn with_upload_tmp_dir(mut self, dir: impl Into<String>) -> Self {
        self.upload_tmp_dir = dir.into();
        self
    }

    /// Sets the session storage directory.
    #[must_use]
    pub fn with_session_storage_path(mut self, dir: impl Into<String>) -> Self {
        self.session_storage_path = dir.into();
        self
    }

    /// Enables or disables automatic session loading.
    #[must_use]
    pub fn with_session_auto_load(mut self, enabled: bool) -> Self {
        self.session_auto_load = enabled;
        self
    }

    /// Sets the post-signal drain budget in milliseconds.
    #[must_use]
    pub fn with_graceful_shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.graceful_shutdown_timeout_ms = ms;
        self
    }

    /// Parses `--flag value` style arguments (no program name) into a
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns the collected error messages when any argument is unknown,
    /// missing its value, or malformed. `--help` is reported as
    /// [`ArgsError::Help`] so callers can print usage and exit cleanly.
    pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Self, ArgsError> {
        let mut config = Self::default();
        let mut errors = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = args[i].as_ref();
            if arg == "--help" {
                return Err(ArgsError::Help);
            }

            let needs_value = !matches!(arg, "--keep-uploads" | "--no-cleanup-temp" | "--no-session-autoload");
            let value = if needs_value {
                match args.get(i + 1) {
                    Some(v) => {
                        i += 1;
                        v.as_ref()
                    }
                    None => {
                        errors.push(format!("missing value for {arg}"));
                        i += 1;
                        continue;
                    }
                }
            } else {
                ""
            };

            let result = match arg {
                "--fcgi-port" => parse_into(value, &mut config.fcgi_port),
                "--fcgi-socket" => {
                    config.fcgi_socket_path = value.to_string();
                    Ok(())
                }
                "--ws-port" => parse_into(value, &mut config.ws_port),
                "--ws-socket" => {
                    config.ws_socket_path = value.to_string();
                    Ok(())
                }
                "--backlog" => parse_into(value, &mut config.backlog),
                "--max-in-flight" => parse_into(value, &mut config.max_in_flight),
                "--arena-capacity" => parse_into(value, &mut config.arena_capacity),
                "--workers" => parse_into(value, &mut config.workers),
                "--output-buffer" => parse_into(value, &mut config.output_buffer_initial),
                "--max-params" => parse_into(value, &mut config.max_params_bytes),
                "--max-stdin" => parse_into(value, &mut config.max_stdin_bytes),
                "--max-request-time" => parse_into(value, &mut config.max_request_time),
                "--upload-tmp" => {
                    config.upload_tmp_dir = value.to_string();
                    Ok(())
                }
                "--session-dir" => {
                    config.session_storage_path = value.to_string();
                    Ok(())
                }
                "--body-preview" => parse_into(value, &mut config.body_preview_limit),
                "--print-env-limit" => parse_into(value, &mut config.print_env_limit),
                "--print-indent" => parse_into(value, &mut config.print_indent),
                "--log-level" => parse_into(value, &mut config.log_level),
                "--log-dest" => {
                    config.log_destination = value.to_string();
                    Ok(())
                }
                "--graceful-timeout" => {
                    parse_into(value, &mut config.graceful_shutdown_timeout_ms)
                }
                "--keep-uploads" => {
                    config.keep_uploaded_files = true;
                    Ok(())
                }
                "--no-cleanup-temp" => {
                    config.cleanup_temp_on_disconnect = false;
                    Ok(())
                }
                "--no-session-autoload" => {
                    config.session_auto_load = false;
                    Ok(())
                }
                _ => Err(format!("unknown arg: {arg}")),
            };

            if let Err(e) = result {
                errors.push(e);
            }
            i += 1;
        }

        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ArgsError::Invalid(errors))
        }
    }
}

/// Argument parsing outcome other than a usable configuration.
#[derive(Debug)]
pub enum ArgsError {
    /// `--help` was requested.
    Help,
    /// One or more arguments were rejected.
    Invalid(Vec<String>),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Help => write!(f, "help requested"),
            Self::Invalid(errors) => write!(f, "{}", errors.join("; ")),
        }
    }
}

impl std::error::Error for ArgsError {}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> Result<(), String> {
    match value.parse() {
        Ok(v) => {
            *slot = v;
            Ok(())
        }
        Err(_) => Err(format!("invalid value: {value}")),
    }
}

/// Loads a `key=value` file into an object.
///
/// Lines starting with `#` or `;` are comments. A line without `=` continues
/// the previous key. Duplicate keys promote the entry to an array.
pub fn load_kv_text(content: &str, out: &mut Value) {
    if !out.is_object() {
        *out = Value::object();
    }
    let mut last_key = String::from("undefined");
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let (key, value) = match line.find('=') {
            Some(eq) => (line[..eq].trim().to_string(), line[eq + 1..].trim().to_string()),
            None => (last_key.clone(), line.to_string()),
        };
        match out.find_mut(&key) {
            None => out.insert(key.clone(), value),
            Some(existing) => match existing {
                Value::String(prev) => {
                    let prev = std::mem::take(prev);
                    let mut arr = Value::array();
                    arr.push(prev);
                    arr.push(value);
                    *existing = arr;
                }
                Value::Array(_) => existing.push(value),
                _ => *existing = Value::String(value),
            },
        }
        last_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.fcgi_port, DEFAULT_FCGI_PORT);
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(config.worker_count(), DEFAULT_MAX_IN_FLIGHT as usize);
        assert!(config.cleanup_temp_on_disconnect);
        assert!(!config.keep_uploaded_files);
    }

    #[test]
    fn builder_chain() {
        let config = GatewayConfig::new()
            .with_fcgi_port(9900)
            .with_max_in_flight(4)
            .with_workers(2)
            .with_max_request_time(30);
        assert_eq!(config.fcgi_port, 9900);
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.max_request_time, 30);
    }

    #[test]
    fn parse_args_basic() {
        let args = ["--fcgi-port", "9100", "--max-in-flight", "8", "--keep-uploads"];
        let config = GatewayConfig::parse_args(&args).expect("valid args");
        assert_eq!(config.fcgi_port, 9100);
        assert_eq!(config.max_in_flight, 8);
        assert!(config.keep_uploaded_files);
    }

    #[test]
    fn parse_args_unknown_flag() {
        let err = GatewayConfig::parse_args(&["--bogus", "1"]).unwrap_err();
        match err {
            ArgsError::Invalid(errors) => assert!(errors[0].contains("--bogus")),
            ArgsError::Help => panic!("expected invalid"),
        }
    }

    #[test]
    fn parse_args_missing_value() {
        let err = GatewayConfig::parse_args(&["--fcgi-port"]).unwrap_err();
        match err {
            ArgsError::Invalid(errors) => assert!(errors[0].contains("missing value")),
            ArgsError::Help => panic!("expected invalid"),
        }
    }

    #[test]
    fn parse_args_help() {
        assert!(matches!(
            GatewayConfig::parse_args(&["--help"]),
            Err(ArgsError::Help)
        ));
    }

    #[test]
    fn kv_loader_basics() {
        let mut out = Value::Null;
        load_kv_text("# comment\nname=alpha\nempty=\n; other\n", &mut out);
        assert_eq!(out.find("name").and_then(Value::as_str), Some("alpha"));
        assert_eq!(out.find("empty").and_then(Value::as_str), Some(""));
    }

    #[test]
    fn kv_loader_duplicates_become_arrays() {
        let mut out = Value::object();
        load_kv_text("tag=a\ntag=b\ntag=c\n", &mut out);
        let tags = out.find("tag").expect("tag entry");
        assert_eq!(tags.len(), 3);
    }

    #[test]
    fn kv_loader_continuation_line() {
        let mut out = Value::object();
        load_kv_text("desc=first\nsecond line\n", &mut out);
        let desc = out.find("desc").expect("desc entry");
        assert_eq!(desc.len(), 2);
    }
}
