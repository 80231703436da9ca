// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Framed request/response between a master process and its workers.
//!
//! Each message is one line of JSON over the worker's paired pipes. The
//! master sends a configuration prelude first, then commands; the worker
//! dispatches by command name and answers `{"out": ...}` on success or
//! `{"err": code, "out": message, "errStack": trace}` on failure. Reaching
//! EOF on the input side ends the worker, so a dying master reaps its
//! children without extra signalling.
//!
//! Per client, requests and responses are strictly FIFO. Binary values
//! cross the boundary base64 encoded.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::config::{OptionSnapshot, Options};
use crate::{Error, Result};

/// Command name of the configuration prelude.
pub static CMD_CONFIG: &str = "config";
/// Command name asking the worker to exit cleanly.
pub static CMD_EXIT: &str = "exit";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default)]
    pub parameter: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<u8>,
    #[serde(rename = "errStack", skip_serializing_if = "Option::is_none")]
    pub err_stack: Option<String>,
}

impl Response {
    pub fn ok(out: Value) -> Response {
        Response {
            out: Some(out),
            ..Default::default()
        }
    }

    pub fn error(err: &Error) -> Response {
        Response {
            out: Some(Value::String(err.to_string())),
            err: Some(err.code()),
            err_stack: Some(format!("{err:?}")),
        }
    }

    /// Convert into the master-side result, re-raising worker errors with
    /// the worker's stack attached.
    pub fn into_result(self) -> Result<Value> {
        match self.err {
            None => Ok(self.out.unwrap_or(Value::Null)),
            Some(code) => Err(Error::Remote {
                code,
                message: match self.out {
                    Some(Value::String(message)) => message,
                    other => format!("{other:?}"),
                },
                stack: self.err_stack.unwrap_or_default(),
            }),
        }
    }
}

/// Encode binary parameters for the JSON framing.
pub fn encode_bin(content: &[u8]) -> Value {
    Value::String(BASE64.encode(content))
}

pub fn decode_bin(value: &Value) -> Result<Vec<u8>> {
    let text = value
        .as_str()
        .ok_or_else(|| Error::Protocol("expected base64 string parameter".into()))?;
    BASE64
        .decode(text)
        .map_err(|err| Error::Protocol(format!("bad base64 parameter: {err}")))
}

pub fn param_str(params: &[Value], index: usize) -> Result<&str> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("missing string parameter {index}")))
}

pub fn param_u64(params: &[Value], index: usize) -> Result<u64> {
    params
        .get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Protocol(format!("missing integer parameter {index}")))
}

/// Worker-side dispatcher: resolves one command against the configuration
/// received in the prelude.
pub type Dispatch<'a> = dyn FnMut(&str, &[Value], &Options) -> Result<Value> + 'a;

/// Run the worker main loop over the given streams until EOF or `exit`.
///
/// The first message must be the configuration prelude; it carries the
/// master's resolved options so the worker never re-reads config files.
pub fn serve<R: BufRead, W: Write>(input: R, mut output: W, dispatch: &mut Dispatch) -> Result<()> {
    let mut options: Option<Options> = None;
    for line in input.lines() {
        let line = line.map_err(|err| Error::Protocol(format!("read request: {err}")))?;
        if line.is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                return Err(Error::Protocol(format!("malformed request: {err}")));
            }
        };
        trace!(cmd = %request.cmd, "worker request");

        let response = if request.cmd == CMD_CONFIG {
            match parse_config(&request.parameter) {
                Ok(parsed) => {
                    options = Some(parsed);
                    Response::ok(Value::Bool(true))
                }
                Err(err) => Response::error(&err),
            }
        } else if request.cmd == CMD_EXIT {
            write_message(&mut output, &Response::ok(Value::Bool(true)))?;
            break;
        } else {
            match &options {
                None => Response::error(&Error::Protocol(
                    "first message must be the configuration".into(),
                )),
                Some(options) => match dispatch(&request.cmd, &request.parameter, options) {
                    Ok(out) => Response::ok(out),
                    Err(err) => {
                        warn!("worker command {} failed: {err}", request.cmd);
                        Response::error(&err)
                    }
                },
            }
        };
        write_message(&mut output, &response)?;
    }
    debug!("worker input closed, exiting");
    Ok(())
}

fn parse_config(parameter: &[Value]) -> Result<Options> {
    let snapshot = parameter
        .first()
        .ok_or_else(|| Error::Protocol("configuration prelude has no payload".into()))?;
    let snapshot: OptionSnapshot = serde_json::from_value(snapshot.clone())?;
    snapshot.into_options()
}

fn write_message<W: Write, T: Serialize>(output: &mut W, message: &T) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    output
        .write_all(line.as_bytes())
        .and_then(|_| output.flush())
        .map_err(|err| Error::Protocol(format!("write response: {err}")))
}

/// The master's handle on one worker process.
///
/// A reader thread drains the worker's stdout into a channel so the
/// parallel executor can poll many clients with a timeout.
pub struct ProtocolClient {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    responses: mpsc::Receiver<Result<Response>>,
    pid: u32,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient").field("pid", &self.pid).finish()
    }
}

impl ProtocolClient {
    /// Wrap a spawned worker whose stdio is piped, and send the
    /// configuration prelude.
    pub fn start(mut child: Child, options: &Options) -> Result<ProtocolClient> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("worker has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("worker has no stdout".into()))?;
        let pid = child.id();

        let (sender, responses) = mpsc::channel();
        std::thread::Builder::new()
            .name(format!("protocol-read-{pid}"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let message = line
                        .map_err(|err| Error::Protocol(format!("read response: {err}")))
                        .and_then(|line| {
                            serde_json::from_str::<Response>(&line)
                                .map_err(|err| Error::Protocol(format!("malformed response: {err}")))
                        });
                    if sender.send(message).is_err() {
                        break;
                    }
                }
                // Channel closes with the sender; EOF means the worker died
                // or exited.
            })
            .expect("spawn protocol reader thread");

        let mut client = ProtocolClient {
            child: Some(child),
            stdin: Some(stdin),
            responses,
            pid,
        };
        client.send(CMD_CONFIG, vec![serde_json::to_value(options.snapshot())?])?;
        client.recv_blocking()?.into_result()?;
        Ok(client)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue one request; responses come back in FIFO order.
    pub fn send(&mut self, cmd: &str, parameter: Vec<Value>) -> Result<()> {
        let request = Request {
            cmd: cmd.to_owned(),
            parameter,
        };
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Protocol("worker stdin already closed".into()))?;
        write_message(stdin, &request)
    }

    /// Wait up to `timeout` for the next response; None on timeout.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Response>> {
        match self.responses.recv_timeout(timeout) {
            Ok(message) => message.map(Some),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::Protocol("worker closed its pipe".into()))
            }
        }
    }

    fn recv_blocking(&mut self) -> Result<Response> {
        self.responses
            .recv()
            .map_err(|_| Error::Protocol("worker closed its pipe".into()))?
    }

    /// Synchronous call: send and wait for the single response.
    pub fn call(&mut self, cmd: &str, parameter: Vec<Value>) -> Result<Value> {
        self.send(cmd, parameter)?;
        self.recv_blocking()?.into_result()
    }

    /// Ask the worker to exit and reap it.
    pub fn close(mut self) {
        let _ = self.send(CMD_EXIT, vec![]);
        let _ = self.recv_timeout(Duration::from_secs(5));
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        // Closing stdin makes the worker observe EOF and exit.
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    fn serve_lines(lines: &str) -> (Vec<Response>, Result<()>) {
        let mut output = Vec::new();
        let mut dispatch = |cmd: &str, params: &[Value], options: &Options| match cmd {
            "echo" => Ok(params.first().cloned().unwrap_or(Value::Null)),
            "stanza" => Ok(json!(options.stanza.clone())),
            "boom" => Err(Error::Format("it broke".into())),
            other => Err(Error::Protocol(format!("unknown command '{other}'"))),
        };
        let result = serve(Cursor::new(lines.to_owned()), &mut output, &mut dispatch);
        let responses = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (responses, result)
    }

    fn config_line() -> String {
        let mut options = Options::default();
        options.stanza = Some("main".to_owned());
        serde_json::to_string(&Request {
            cmd: CMD_CONFIG.into(),
            parameter: vec![serde_json::to_value(options.snapshot()).unwrap()],
        })
        .unwrap()
    }

    #[test]
    fn config_then_dispatch() {
        let lines = format!(
            "{}\n{}\n",
            config_line(),
            r#"{"cmd":"stanza","parameter":[]}"#
        );
        let (responses, result) = serve_lines(&lines);
        result.unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].out, Some(json!("main")));
        assert_eq!(responses[1].err, None);
    }

    #[test]
    fn command_before_config_is_rejected() {
        let (responses, result) = serve_lines("{\"cmd\":\"echo\",\"parameter\":[1]}\n");
        result.unwrap();
        assert_eq!(responses[0].err, Some(57));
    }

    #[test]
    fn errors_carry_code_message_and_stack() {
        let lines = format!("{}\n{}\n", config_line(), r#"{"cmd":"boom"}"#);
        let (responses, _) = serve_lines(&lines);
        let response = &responses[1];
        assert_eq!(response.err, Some(55));
        assert_eq!(response.out, Some(json!("format error: it broke")));
        assert!(response.err_stack.is_some());

        let err = response.clone().into_result().unwrap_err();
        assert_eq!(err.code(), 55);
        assert!(err.to_string().contains("raised from worker"));
    }

    #[test]
    fn exit_stops_the_loop() {
        let lines = format!(
            "{}\n{}\n{}\n",
            config_line(),
            r#"{"cmd":"exit"}"#,
            r#"{"cmd":"echo","parameter":["never reached"]}"#
        );
        let (responses, result) = serve_lines(&lines);
        result.unwrap();
        // Config ack plus exit ack, nothing after.
        assert_eq!(responses.len(), 2);
    }

    #[test]
    fn eof_ends_the_worker() {
        let (responses, result) = serve_lines(&format!("{}\n", config_line()));
        result.unwrap();
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn binary_round_trip() {
        let original = vec![0u8, 1, 2, 255, 254];
        let encoded = encode_bin(&original);
        assert_eq!(decode_bin(&encoded).unwrap(), original);
        assert!(decode_bin(&json!(42)).is_err());
    }
}
