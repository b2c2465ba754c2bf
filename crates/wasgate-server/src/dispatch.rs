//! Pre-handler request preparation and finalization, shared by the FastCGI
//! worker path and the WebSocket engine's plain-HTTP mode.

use std::sync::Arc;

use wasgate_core::config::{load_kv_text, GatewayConfig};
use wasgate_core::request::RequestData;
use wasgate_core::{Request, Value};
use wasgate_proto::body::parse_form_body;
use wasgate_proto::http::{parse_cookie_header, parse_query_string};

use crate::file_cache::FileCache;
use crate::session::SessionStore;

/// A request handler: reads the request, writes response body bytes. The
/// engine does the protocol framing, so the same handler serves FastCGI,
/// WebSocket messages, and plain HTTP.
pub type Handler = Arc<dyn Fn(&Request, &mut Vec<u8>) + Send + Sync + 'static>;

/// Runs the pre-handler parsing steps on a worker thread: endpoint context
/// file, cookies, query string, form body, optional session auto-load, and
/// the default Content-Type response header.
pub fn prepare_request_data(
    config: &GatewayConfig,
    file_cache: &FileCache,
    sessions: &SessionStore,
    data: &mut RequestData,
) {
    data.context = Value::object();
    let endpoint = data
        .env
        .find(&config.endpoint_file_var)
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(path) = endpoint {
        if !path.is_empty() {
            if let Some(content) = file_cache.read(&path) {
                load_kv_text(&content, &mut data.context);
            }
        }
    }

    let cookie_raw = data
        .env
        .find(&config.http_cookies_var)
        .map(Value::to_display_string)
        .unwrap_or_default();
    for (name, value) in parse_cookie_header(&cookie_raw) {
        data.cookies.insert(name, value);
    }

    let query_raw = data
        .env
        .find(&config.http_query_var)
        .map(Value::to_display_string)
        .unwrap_or_default();
    for (name, value) in parse_query_string(&query_raw) {
        data.params.insert(name, value);
    }

    let content_type = data
        .env
        .find("CONTENT_TYPE")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(content_type) = content_type {
        let body = std::mem::take(&mut data.body);
        parse_form_body(
            &content_type,
            &body,
            &config.upload_tmp_dir,
            &mut data.params,
            &mut data.files,
        );
        data.body = body;
    }

    if config.session_auto_load {
        let presented = data
            .cookies
            .find(&config.session_cookie_name)
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(id) = presented {
            if !id.is_empty() {
                data.session_id = id;
                sessions.start(data, config);
            }
        }
    }

    if data.headers.find("Content-Type").is_none() {
        data.headers
            .insert("Content-Type", config.default_content_type.clone());
    }
}

/// Finalizes request state before reclamation: unlinks upload temp files
/// (policy permitting) and drops the body and file records.
pub fn finalize_request_data(data: &mut RequestData, config: &GatewayConfig) {
    if !config.keep_uploaded_files && config.cleanup_temp_on_disconnect {
        for entry in data.files.items() {
            if let Some(path) = entry.find("temp_path").and_then(Value::as_str) {
                if !path.is_empty() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }
    data.files = Value::array();
    data.body.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixtures(dir: &std::path::Path) -> (GatewayConfig, Arc<FileCache>, SessionStore) {
        let config = GatewayConfig::default()
            .with_upload_tmp_dir(dir.to_string_lossy().into_owned())
            .with_session_storage_path(dir.join("sessions").to_string_lossy().into_owned());
        let cache = Arc::new(FileCache::new(Duration::from_secs(60), 1024 * 1024));
        let sessions = SessionStore::new(dir.join("sessions"), Arc::clone(&cache));
        (config, cache, sessions)
    }

    #[test]
    fn prepare_parses_cookies_query_and_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config, cache, sessions) = fixtures(dir.path());

        let mut data = RequestData::new();
        data.env.insert("HTTP_COOKIE", "theme=dark; session_id=");
        data.env.insert("QUERY_STRING", "page=2&q=hello+world");
        data.env.insert("CONTENT_TYPE", "application/x-www-form-urlencoded");
        data.body = b"posted=yes".to_vec();

        prepare_request_data(&config, &cache, &sessions, &mut data);

        assert_eq!(data.cookies.find("theme").and_then(Value::as_str), Some("dark"));
        assert_eq!(data.params.find("page").and_then(Value::as_str), Some("2"));
        assert_eq!(data.params.find("q").and_then(Value::as_str), Some("hello world"));
        assert_eq!(data.params.find("posted").and_then(Value::as_str), Some("yes"));
        assert_eq!(
            data.headers.find("Content-Type").and_then(Value::as_str),
            Some(config.default_content_type.as_str())
        );
        // Empty session cookie does not start a session.
        assert!(data.session_id.is_empty());
    }

    #[test]
    fn prepare_loads_endpoint_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config, cache, sessions) = fixtures(dir.path());

        let endpoint = dir.path().join("endpoint.conf");
        std::fs::write(&endpoint, "route=/demo\nrole=admin\n").expect("write endpoint");

        let mut data = RequestData::new();
        data.env
            .insert("SCRIPT_FILENAME", endpoint.to_string_lossy().into_owned());
        prepare_request_data(&config, &cache, &sessions, &mut data);

        assert_eq!(data.context.find("route").and_then(Value::as_str), Some("/demo"));
        assert_eq!(data.context.find("role").and_then(Value::as_str), Some("admin"));
    }

    #[test]
    fn prepare_auto_loads_session_from_cookie() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config, cache, sessions) = fixtures(dir.path());

        // Persist a session, then present its cookie.
        let mut seed = RequestData::new();
        seed.session_id = crate::session::generate_id();
        seed.session.insert("visits", 3.0);
        assert!(sessions.save(&seed));

        let mut data = RequestData::new();
        data.env
            .insert("HTTP_COOKIE", format!("session_id={}", seed.session_id));
        prepare_request_data(&config, &cache, &sessions, &mut data);

        assert_eq!(data.session_id, seed.session_id);
        assert_eq!(data.session.find("visits").map(|v| v.to_number(0.0)), Some(3.0));
    }

    #[test]
    fn finalize_unlinks_temp_files_per_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let temp = dir.path().join("fcgi_upload_test01");
        std::fs::write(&temp, b"upload").expect("write temp");

        let mut entry = Value::object();
        entry.insert("temp_path", temp.to_string_lossy().into_owned());
        let mut data = RequestData::new();
        data.files.push(entry);
        data.body = b"body".to_vec();

        let config = GatewayConfig::default();
        finalize_request_data(&mut data, &config);
        assert!(!temp.exists());
        assert!(data.files.is_empty());
        assert!(data.body.is_empty());
    }

    #[test]
    fn finalize_keeps_files_when_configured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let temp = dir.path().join("fcgi_upload_keep01");
        std::fs::write(&temp, b"upload").expect("write temp");

        let mut entry = Value::object();
        entry.insert("temp_path", temp.to_string_lossy().into_owned());
        let mut data = RequestData::new();
        data.files.push(entry);

        let mut config = GatewayConfig::default();
        config.keep_uploaded_files = true;
        finalize_request_data(&mut data, &config);
        assert!(temp.exists());
    }
}
