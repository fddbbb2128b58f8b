//! stint daemon entrypoint.
//!
//! A single-writer service that owns the timer engine for one user. Clients
//! talk to it over a Unix socket with newline-delimited JSON requests; every
//! connection carries exactly one request, except `watch`, which keeps the
//! connection open and streams dashboard snapshots.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stint_core::{config, Tracker};
use stint_daemon_protocol::{ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES};
use tokio::runtime::{Handle, Runtime};

mod handlers;

const SOCKET_NAME: &str = "daemon.sock";
const SOCKET_ENV: &str = "STINT_DAEMON_SOCKET";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const WATCH_HEARTBEAT_SECS: u64 = 15;
const WATCH_WRITE_TIMEOUT_SECS: u64 = 5;

fn main() {
    init_logging();

    let stint_home = match config::stint_home() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve stint home");
            std::process::exit(1);
        }
    };

    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            std::process::exit(1);
        }
    };
    let _runtime_guard = runtime.enter();

    let tracker = match Tracker::from_config(&config, &stint_home) {
        Ok(tracker) => Arc::new(tracker),
        Err(err) => {
            error!(error = %err, "Failed to open tracker");
            std::process::exit(1);
        }
    };

    let socket_path = match daemon_socket_path(&stint_home) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        user = ?config.user.id,
        mirror = ?config.mirror.backend,
        "stint daemon started"
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let tracker = Arc::clone(&tracker);
                let handle = runtime.handle().clone();
                thread::spawn(move || handle_connection(stream, tracker, handle));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("STINT_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("stint-worker")
        .enable_all()
        .build()
}

fn daemon_socket_path(stint_home: &Path) -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(format!("{} is set but empty", SOCKET_ENV));
        }
        return Ok(PathBuf::from(trimmed));
    }
    Ok(stint_home.join(SOCKET_NAME))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, tracker: Arc<Tracker>, handle: Handle) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.method == Method::Watch {
        let _ = stream.set_write_timeout(Some(Duration::from_secs(WATCH_WRITE_TIMEOUT_SECS)));
        handlers::stream_watch(
            &mut stream,
            request,
            &tracker,
            &handle,
            Duration::from_secs(WATCH_HEARTBEAT_SECS),
        );
        return;
    }

    let response = handlers::handle_request(request, &tracker);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

pub(crate) fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
