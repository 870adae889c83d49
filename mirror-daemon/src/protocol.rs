use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_ATTEMPTS: u32 = 5;
const STARTUP_BACKOFF: Duration = Duration::from_millis(100);

/// Commands understood by the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonCommand {
    Status,
    Stop,
}

/// One line of JSON sent to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: DaemonCommand,
}

impl From<DaemonCommand> for DaemonRequest {
    fn from(cmd: DaemonCommand) -> Self {
        Self { cmd }
    }
}

/// One line of JSON sent back; `data` on success, `error` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, DaemonError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, Some(message)) => Err(DaemonError::Protocol(message)),
            (false, None) => Err(DaemonError::Protocol("daemon reported an error".to_string())),
        }
    }
}

/// Blocking client for the control socket under one home directory.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn new(home: &Path) -> Self {
        Self {
            socket: socket_path(home),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send one request and read one response line.
    pub fn call(&self, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        let mut stream = self.connect()?;
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .and_then(|()| stream.flush())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut reply = String::new();
        let read = BufReader::new(stream)
            .read_line(&mut reply)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed connection before responding".to_string(),
            ));
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }

    /// `call`, retrying while the socket is absent or refusing connections.
    pub fn call_while_starting(
        &self,
        request: &DaemonRequest,
    ) -> Result<DaemonResponse, DaemonError> {
        let mut attempt = 1;
        loop {
            match self.call(request) {
                Err(DaemonError::DaemonNotRunning { .. }) if attempt < STARTUP_ATTEMPTS => {
                    attempt += 1;
                    sleep(STARTUP_BACKOFF);
                }
                other => return other,
            }
        }
    }

    fn connect(&self) -> Result<UnixStream, DaemonError> {
        if !self.socket.exists() {
            return Err(self.not_running());
        }
        UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                self.not_running()
            }
            _ => io_err(&self.socket, err),
        })
    }

    fn not_running(&self) -> DaemonError {
        DaemonError::DaemonNotRunning {
            socket: self.socket.clone(),
        }
    }
}

/// Send one request to the daemon under `home`.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    ControlClient::new(home).call(request)
}

/// Counters, echo entries, and uptime of the running daemon. A daemon that
/// is still binding its socket gets a few chances before being reported down.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    ControlClient::new(home)
        .call_while_starting(&DaemonCommand::Status.into())?
        .into_result()
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    ControlClient::new(home)
        .call(&DaemonCommand::Stop.into())?
        .into_result()
        .map(|_| ())
}
