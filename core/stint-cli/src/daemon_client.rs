//! Client helper for talking to the stint daemon.
//!
//! The daemon is the only writer; the CLI never opens the database itself.

use serde_json::Value;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use stint_daemon_protocol::{Method, Request, Response, MAX_REQUEST_BYTES};

const SOCKET_ENV: &str = "STINT_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Cannot reach stint daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Transport(String),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| ClientError::Transport("Home directory not found".to_string()))?;
    Ok(home.join(".stint").join(SOCKET_NAME))
}

/// Sends one request and returns the `data` of a successful response.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    let mut stream = connect(Some(Duration::from_millis(READ_TIMEOUT_MS)))?;
    write_request(&mut stream, method, params)?;
    let response = read_response(&mut stream)?;
    into_data(response)
}

/// Opens a `watch` stream and hands each snapshot to `on_snapshot` until it
/// returns `false` or the daemon closes the connection.
pub fn watch<F>(mut on_snapshot: F) -> Result<(), ClientError>
where
    F: FnMut(Value) -> bool,
{
    let mut stream = connect(None)?;
    write_request(&mut stream, Method::Watch, None)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| ClientError::Transport(format!("Watch stream failed: {}", err)))?;
        if read == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let response: Response = serde_json::from_str(&line).map_err(|err| {
            ClientError::Transport(format!("Failed to parse watch snapshot: {}", err))
        })?;
        if !on_snapshot(into_data(response)?) {
            return Ok(());
        }
    }
}

fn connect(read_timeout: Option<Duration>) -> Result<UnixStream, ClientError> {
    let path = socket_path()?;
    let stream =
        UnixStream::connect(&path).map_err(|source| ClientError::Connect { path, source })?;
    let _ = stream.set_read_timeout(read_timeout);
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    Ok(stream)
}

fn write_request(
    stream: &mut UnixStream,
    method: Method,
    params: Option<Value>,
) -> Result<(), ClientError> {
    let request = Request::new(method, params);
    serde_json::to_writer(&mut *stream, &request)
        .map_err(|err| ClientError::Transport(format!("Failed to write request: {}", err)))?;
    stream
        .write_all(b"\n")
        .map_err(|err| ClientError::Transport(format!("Failed to flush request: {}", err)))?;
    stream.flush().ok();
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::Transport(
                        "Response exceeded maximum size".to_string(),
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
                return Err(ClientError::Transport(
                    "Timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => {
                return Err(ClientError::Transport(format!(
                    "Failed to read response: {}",
                    err
                )))
            }
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::Transport(
            "Daemon response was empty".to_string(),
        ));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::Transport(format!("Failed to parse response JSON: {}", err)))
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    let (code, message) = response
        .error
        .map(|err| (err.code, err.message))
        .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
    Err(ClientError::Daemon { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_request(stream: &mut UnixStream) -> Request {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).expect("read request");
        serde_json::from_str(&line).expect("parse request")
    }

    fn reply(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
        let mut payload = serde_json::to_vec(response).expect("serialize");
        payload.push(b'\n');
        stream.write_all(&payload)
    }

    #[test]
    fn call_returns_data_and_maps_daemon_errors() {
        let _guard = env_lock();
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().expect("utf8 path"));

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            assert_eq!(request.method, Method::Start);
            reply(
                &mut stream,
                &Response::ok(None, serde_json::json!({ "activity_id": 7 })),
            )
            .expect("write response");

            let (mut stream, _) = listener.accept().expect("accept");
            read_request(&mut stream);
            reply(
                &mut stream,
                &Response::error(None, "not_found", "Not found: activity 9"),
            )
            .expect("write response");
        });

        let data = call(Method::Start, Some(serde_json::json!({ "activity_id": 7 })))
            .expect("start");
        assert_eq!(data["activity_id"], 7);

        let err = call(Method::Stop, Some(serde_json::json!({ "activity_id": 9 })))
            .expect_err("daemon error");
        match err {
            ClientError::Daemon { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("unexpected error: {other}"),
        }

        server.join().expect("server");
    }

    #[test]
    fn watch_stops_when_callback_declines() {
        let _guard = env_lock();
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).expect("bind");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().expect("utf8 path"));

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            assert_eq!(request.method, Method::Watch);
            // The client hangs up after two snapshots, so later writes may fail.
            for total in [0, 1000, 2000] {
                let _ = reply(
                    &mut stream,
                    &Response::ok(None, serde_json::json!({ "daily_total_ms": total })),
                );
            }
        });

        let mut totals = Vec::new();
        watch(|snapshot| {
            totals.push(snapshot["daily_total_ms"].as_i64().unwrap_or(-1));
            totals.len() < 2
        })
        .expect("watch");
        assert_eq!(totals, vec![0, 1000]);

        server.join().expect("server");
    }

    #[test]
    fn missing_daemon_reports_socket_path() {
        let _guard = env_lock();
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("absent.sock");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().expect("utf8 path"));

        let err = call(Method::GetHealth, None).expect_err("no daemon");
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(err.to_string().contains("absent.sock"));
    }
}
