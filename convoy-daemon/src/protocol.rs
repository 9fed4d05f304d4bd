//! Control protocol spoken over `run/daemon.sock`.
//!
//! Newline-delimited JSON. Every request is an object tagged by `cmd` and
//! gets exactly one reply line:
//!
//! ```text
//! -> {"cmd":"reconcile"}
//! <- {"ok":true,"data":{"outcome":"no_change","head":"4f1c..."}}
//! -> {"cmd":"reconcile"}
//! <- {"ok":false,"code":"busy","error":"a reconciliation cycle is already running"}
//! ```

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use convoy_core::paths::socket_path_at;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};

/// A command understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Metrics,
    Reconcile,
    Stop,
}

impl ControlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Status => "status",
            ControlRequest::Metrics => "metrics",
            ControlRequest::Reconcile => "reconcile",
            ControlRequest::Stop => "stop",
        }
    }

    /// A reconcile answers only after health verification, retries included.
    fn reply_timeout(&self) -> Duration {
        match self {
            ControlRequest::Reconcile => Duration::from_secs(15 * 60),
            _ => Duration::from_secs(10),
        }
    }
}

/// Why the daemon refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyCode {
    Busy,
    BadRequest,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ReplyCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    pub fn data(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            code: None,
            error: None,
        }
    }

    pub fn refused(code: ReplyCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            code: Some(code),
            error: Some(message.into()),
        }
    }

    /// The payload, or the refusal as a [`DaemonError`].
    pub fn into_result(self) -> Result<Value, DaemonError> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let message = self.error.unwrap_or_else(|| "no reason given".to_string());
        Err(match self.code {
            Some(ReplyCode::Busy) => DaemonError::Busy(message),
            _ => DaemonError::Rejected(message),
        })
    }
}

/// Decode one request line, or the reply explaining why it was not understood.
pub fn parse_request(line: &str) -> Result<ControlRequest, ControlReply> {
    serde_json::from_str(line).map_err(|err| {
        let named = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|v| v.get("cmd")?.as_str().map(str::to_string));
        match named {
            Some(cmd) => ControlReply::refused(ReplyCode::BadRequest, format!("unknown command '{cmd}'")),
            None => ControlReply::refused(ReplyCode::BadRequest, format!("malformed request: {err}")),
        }
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Blocking client used by the CLI. One connection per request.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    /// Client for the daemon of the convoy home at `home`.
    pub fn for_home(home: &Path) -> Self {
        Self::at(socket_path_at(home))
    }

    pub fn at(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send `request`; refusals come back as `Err`.
    pub fn call(&self, request: ControlRequest) -> Result<Value, DaemonError> {
        self.exchange(request)?.into_result()
    }

    /// Send `request` and return the raw reply.
    pub fn exchange(&self, request: ControlRequest) -> Result<ControlReply, DaemonError> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|err| match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => DaemonError::DaemonNotRunning {
                socket: self.socket.clone(),
            },
            _ => io_err(&self.socket, err),
        })?;
        stream
            .set_read_timeout(Some(request.reply_timeout()))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        stream
            .write_all(&line)
            .map_err(|e| io_err(&self.socket, e))?;

        let mut reply = String::new();
        let read = BufReader::new(&stream)
            .read_line(&mut reply)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(format!(
                "daemon hung up before answering '{}'",
                request.name()
            )));
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }

    /// `status`, tolerating a daemon that is still binding its socket.
    pub fn status(&self) -> Result<Value, DaemonError> {
        const ATTEMPTS: u32 = 5;
        let mut attempt = 1;
        loop {
            match self.call(ControlRequest::Status) {
                Err(DaemonError::DaemonNotRunning { .. }) if attempt < ATTEMPTS => {
                    attempt += 1;
                    sleep(Duration::from_millis(100));
                }
                other => return other,
            }
        }
    }
}
