//! Control protocol spoken over `~/.pullwatch/agent.sock`.
//!
//! One JSON object per line in each direction: the client writes
//! `{"cmd": "status" | "stop" | "poll"}` and reads back
//! `{"ok": bool, "data"?: ..., "error"?: "..."}`. The command travels as a
//! plain string so an agent can answer an unknown command with an error
//! instead of dropping the connection.

use std::fmt;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// Upper bound on how long a client waits for the agent's answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// `status` is retried this often while a freshly started agent binds.
const STATUS_ATTEMPTS: u32 = 5;
const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Stop,
    Poll,
}

impl ControlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlCommand::Status => "status",
            ControlCommand::Stop => "stop",
            ControlCommand::Poll => "poll",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(ControlCommand::Status),
            "stop" => Ok(ControlCommand::Stop),
            "poll" => Ok(ControlCommand::Poll),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
}

impl From<ControlCommand> for DaemonRequest {
    fn from(command: ControlCommand) -> Self {
        Self {
            cmd: command.as_str().to_string(),
        }
    }
}

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

    /// Payload of a successful answer; a refusal becomes [`DaemonError::Protocol`].
    pub fn into_result(self) -> Result<Value, DaemonError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, Some(message)) => Err(DaemonError::Protocol(message)),
            (false, None) => Err(DaemonError::Protocol("agent refused the request".to_string())),
        }
    }
}

/// Blocking client for one agent's control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    pub fn for_home(home: &Path) -> Self {
        Self {
            socket: socket_path(home),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send `command` and return the agent's payload.
    pub fn call(&self, command: ControlCommand) -> Result<Value, DaemonError> {
        self.exchange(&command.into())?.into_result()
    }

    /// One request line out, one response line back, on a fresh connection.
    pub fn exchange(&self, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        let stream = self.connect()?;
        stream
            .set_read_timeout(Some(REPLY_TIMEOUT))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        (&stream)
            .write_all(&line)
            .and_then(|()| (&stream).flush())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut reply = String::new();
        let read = BufReader::new(&stream)
            .read_line(&mut reply)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(format!(
                "agent hung up without answering `{}`",
                request.cmd
            )));
        }
        Ok(serde_json::from_str(reply.trim_end())?)
    }

    fn connect(&self) -> Result<UnixStream, DaemonError> {
        if !self.socket.exists() {
            return Err(self.not_running());
        }
        UnixStream::connect(&self.socket).map_err(|err| {
            if agent_gone(&err) {
                self.not_running()
            } else {
                io_err(&self.socket, err)
            }
        })
    }

    fn not_running(&self) -> DaemonError {
        DaemonError::DaemonNotRunning {
            socket: self.socket.clone(),
        }
    }
}

/// A stale socket file left by a dead agent refuses or resets connections.
fn agent_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
    )
}

/// Runtime status of the agent under `home`.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let client = ControlClient::for_home(home);
    let mut attempt = 1;
    loop {
        match client.call(ControlCommand::Status) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < STATUS_ATTEMPTS => {
                attempt += 1;
                sleep(STATUS_RETRY_DELAY);
            }
            result => return result,
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    ControlClient::for_home(home)
        .call(ControlCommand::Stop)
        .map(|_| ())
}

/// Ask the agent to start a pass now instead of waiting out the interval.
pub fn request_poll(home: &Path) -> Result<Value, DaemonError> {
    ControlClient::for_home(home).call(ControlCommand::Poll)
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;
    use std::thread;

    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().expect("home");
        let err = ControlClient::for_home(home.path())
            .call(ControlCommand::Poll)
            .unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }

    #[test]
    fn stale_socket_file_means_not_running() {
        let home = TempDir::new().expect("home");
        let client = ControlClient::for_home(home.path());
        std::fs::create_dir_all(client.socket().parent().expect("socket dir")).expect("mkdir");
        drop(UnixListener::bind(client.socket()).expect("bind"));

        let err = client.call(ControlCommand::Stop).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
    }

    #[test]
    fn refusal_becomes_protocol_error() {
        let err = DaemonResponse::error("unknown command 'x'")
            .into_result()
            .unwrap_err();
        assert!(err.to_string().contains("unknown command"), "got: {err}");

        let data = DaemonResponse::ok(json!({"polled": true}))
            .into_result()
            .expect("ok");
        assert_eq!(data["polled"], json!(true));
    }

    #[test]
    fn ok_response_omits_error_field() {
        let encoded = serde_json::to_string(&DaemonResponse::ok(json!(1))).expect("encode");
        assert_eq!(encoded, r#"{"ok":true,"data":1}"#);
    }

    #[test]
    fn command_names_round_trip_and_unknown_is_rejected() {
        for command in [ControlCommand::Status, ControlCommand::Stop, ControlCommand::Poll] {
            assert_eq!(command.as_str().parse::<ControlCommand>(), Ok(command));
        }
        assert!("reload".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn client_sends_one_line_and_reads_one_line() {
        let home = TempDir::new().expect("home");
        let client = ControlClient::for_home(home.path());
        std::fs::create_dir_all(client.socket().parent().expect("socket dir")).expect("mkdir");
        let listener = UnixListener::bind(client.socket()).expect("bind");

        let agent = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut request = String::new();
            BufReader::new(&stream)
                .read_line(&mut request)
                .expect("read request");
            let mut reply = serde_json::to_vec(&DaemonResponse::ok(json!({"ticks": 3})))
                .expect("encode");
            reply.push(b'\n');
            (&stream).write_all(&reply).expect("write reply");
            request
        });

        let data = client.call(ControlCommand::Status).expect("status");
        assert_eq!(data["ticks"], json!(3));
        assert_eq!(agent.join().expect("agent thread"), "{\"cmd\":\"status\"}\n");
    }
}
