//! The `wasgate` binary: argument parsing, demo handlers, and process
//! lifecycle. Exits 0 on clean shutdown and 1 on startup failure.

use std::process::ExitCode;
use std::sync::Arc;

use wasgate::handler;
use wasgate_core::config::{ArgsError, GatewayConfig};
use wasgate_server::Handlers;

fn usage() {
    eprintln!(
        "Usage: wasgate [options]\n\n\
         Options:\n\
         \x20 --fcgi-port N          FastCGI TCP port (default 9000)\n\
         \x20 --fcgi-socket PATH     FastCGI UNIX socket instead of TCP\n\
         \x20 --ws-port N            WebSocket TCP port (default 9001)\n\
         \x20 --ws-socket PATH       WebSocket UNIX socket instead of TCP\n\
         \x20 --backlog N            Listen backlog\n\
         \x20 --max-in-flight N      Concurrent request ceiling (arena count)\n\
         \x20 --arena-capacity N     Bytes per arena\n\
         \x20 --workers N            Worker threads (default: max in-flight)\n\
         \x20 --output-buffer N      Initial out-buffer reservation\n\
         \x20 --max-params N         Per-request PARAMS byte cap\n\
         \x20 --max-stdin N          Per-request body byte cap\n\
         \x20 --max-request-time N   Request timeout in seconds (0 disables)\n\
         \x20 --upload-tmp DIR       Upload temp directory\n\
         \x20 --session-dir DIR      Session storage directory\n\
         \x20 --keep-uploads         Keep uploaded temp files\n\
         \x20 --no-cleanup-temp      Skip temp cleanup on disconnect\n\
         \x20 --no-session-autoload  Do not load sessions automatically\n\
         \x20 --body-preview N       Body preview byte cap in dump output\n\
         \x20 --print-env-limit N    Entries per section in dump output\n\
         \x20 --print-indent N       Indent width in dump output\n\
         \x20 --log-level N          0 error, 1 info, 2 debug, 3 trace\n\
         \x20 --log-dest DEST        stderr or a file path\n\
         \x20 --graceful-timeout MS  Post-signal drain budget\n\
         \x20 --help                 This text"
    );
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match GatewayConfig::parse_args(&args) {
        Ok(config) => config,
        Err(ArgsError::Help) => {
            usage();
            return ExitCode::SUCCESS;
        }
        Err(ArgsError::Invalid(errors)) => {
            for error in errors {
                eprintln!("{error}");
            }
            usage();
            return ExitCode::FAILURE;
        }
    };

    let shared = Arc::new(config.clone());
    let handlers = Handlers {
        fcgi: handler::dump_handler(Arc::clone(&shared)),
        ws: handler::ws_echo_handler(),
        http: handler::dump_handler(shared),
    };

    match wasgate_server::run(config, handlers) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wasgate: {e}");
            ExitCode::FAILURE
        }
    }
}
