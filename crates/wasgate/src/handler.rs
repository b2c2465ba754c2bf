//! Demo handlers for the `wasgate` binary.
//!
//! The dump handler renders everything the gateway parsed out of the
//! request (environment, endpoint context, cookies, params, response
//! headers, files, session) plus a printable preview of the body. It is
//! the quickest way to see what a webserver or client actually sent.

use std::fmt::Write as _;
use std::sync::Arc;

use wasgate_core::config::GatewayConfig;
use wasgate_core::request::RequestData;
use wasgate_core::Value;
use wasgate_server::Handler;

/// Builds the dump handler used for FastCGI requests and plain-HTTP mode.
#[must_use]
pub fn dump_handler(config: Arc<GatewayConfig>) -> Handler {
    Arc::new(move |req, out| {
        let data = req.data.lock();
        let text = render_dump(&config, &data);
        out.extend_from_slice(text.as_bytes());
    })
}

/// Builds the echo handler used for WebSocket messages.
#[must_use]
pub fn ws_echo_handler() -> Handler {
    Arc::new(|req, out| {
        out.extend_from_slice(&req.data.lock().body);
    })
}

fn render_dump(config: &GatewayConfig, data: &RequestData) -> String {
    let mut text = String::new();

    for (name, value) in data.headers.entries() {
        match value {
            Value::String(s) => {
                let _ = write!(text, "{name}: {s}\r\n");
            }
            other => {
                let _ = write!(text, "{name}: {}\r\n", other.to_json());
            }
        }
    }
    text.push_str("\r\n");

    let sections: [(&str, &Value); 7] = [
        ("ENV", &data.env),
        ("CONTEXT", &data.context),
        ("COOKIES", &data.cookies),
        ("PARAMS", &data.params),
        ("HEADERS(OUT)", &data.headers),
        ("FILES", &data.files),
        ("SESSION", &data.session),
    ];
    for (title, value) in sections {
        let _ = write!(text, "-- {title} --\n");
        value.print_limited(&mut text, config.print_env_limit, config.print_indent);
    }

    let _ = write!(text, "\n-- BODY ({} bytes) --\n", data.body_bytes);
    let cap = if config.body_preview_limit == 0 {
        1024
    } else {
        config.body_preview_limit
    };
    let shown = data.body.len().min(cap);
    for &byte in &data.body[..shown] {
        if (32..127).contains(&byte) || byte == b'\n' || byte == b'\r' || byte == b'\t' {
            text.push(byte as char);
        } else {
            text.push('.');
        }
    }
    if shown < data.body.len() {
        text.push_str("\n[truncated]");
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> RequestData {
        let mut data = RequestData::new();
        data.env.insert("REQUEST_METHOD", "GET");
        data.cookies.insert("theme", "dark");
        data.params.insert("q", "search");
        data.headers.insert("Content-Type", "text/plain");
        data.body = b"hello \x01 world".to_vec();
        data.body_bytes = data.body.len();
        data
    }

    #[test]
    fn dump_contains_all_sections() {
        let config = GatewayConfig::default();
        let text = render_dump(&config, &sample_data());
        for section in [
            "-- ENV --",
            "-- CONTEXT --",
            "-- COOKIES --",
            "-- PARAMS --",
            "-- HEADERS(OUT) --",
            "-- FILES --",
            "-- SESSION --",
            "-- BODY (14 bytes) --",
        ] {
            assert!(text.contains(section), "missing {section}");
        }
        assert!(text.starts_with("Content-Type: text/plain\r\n\r\n"));
        assert!(text.contains("REQUEST_METHOD: \"GET\""));
    }

    #[test]
    fn dump_masks_unprintable_body_bytes() {
        let config = GatewayConfig::default();
        let text = render_dump(&config, &sample_data());
        assert!(text.contains("hello . world"));
    }

    #[test]
    fn dump_truncates_long_bodies() {
        let mut config = GatewayConfig::default();
        config.body_preview_limit = 8;
        let mut data = sample_data();
        data.body = vec![b'a'; 100];
        data.body_bytes = 100;
        let text = render_dump(&config, &data);
        assert!(text.contains("[truncated]"));
        assert!(!text.contains(&"a".repeat(100)));
    }
}
