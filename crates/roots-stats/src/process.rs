//! Statistics engine running as a child process (JSON-RPC 2.0 over stdio).
//!
//! Lifecycle:
//! 1. Spawn the engine command with piped stdin/stdout
//! 2. Send `initialize` with the libraries to load, wait for the response
//! 3. Issue `assign` / `eval` / `assign_eval` / `remove` requests, one at a time
//!
//! Lines that are not the response to the pending request (log notifications
//! from the engine) are skipped. A timed-out or failed exchange marks the
//! connection broken so the pool discards it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::connection::{ConnectionFactory, StatsConnection};
use crate::error::StatsError;
use crate::value::{StatsValue, StatsVector};

/// Libraries every connection loads during the handshake.
pub const DEFAULT_LIBRARIES: &[&str] = &["dtw", "changepoint", "relaimpo", "tsoutliers"];

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How to launch the engine.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub libraries: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self {
            program: "Rscript".to_string(),
            args: vec!["scripts/stats_bridge.R".to_string()],
            working_dir: None,
            libraries: DEFAULT_LIBRARIES.iter().map(|s| s.to_string()).collect(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ─── Connection ─────────────────────────────────────────────────────

pub struct ProcessConnection {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    request_timeout: Duration,
    broken: bool,
}

impl ProcessConnection {
    /// Spawn the engine and perform the `initialize` handshake.
    pub async fn spawn(command: &EngineCommand) -> Result<Self, StatsError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| StatsError::Spawn(format!("{}: {e}", command.program)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StatsError::Spawn("engine stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StatsError::Spawn("engine stdout unavailable".into()))?;

        let mut conn = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
            request_timeout: command.request_timeout,
            broken: false,
        };

        let params = json!({
            "client": "roots",
            "version": env!("CARGO_PKG_VERSION"),
            "libraries": command.libraries,
        });
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.exchange("initialize", params)).await {
            Ok(Ok(_)) => {
                tracing::debug!(program = %command.program, "statistics engine connected");
                Ok(conn)
            }
            Ok(Err(e)) => Err(StatsError::Handshake(e.to_string())),
            Err(_) => Err(StatsError::Handshake(format!(
                "no response within {HANDSHAKE_TIMEOUT:?}"
            ))),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    async fn send(&mut self, msg: &Value) -> Result<(), StatsError> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Value, StatsError> {
        let mut line = String::new();
        let n = self.stdout.read_line(&mut line).await?;
        if n == 0 {
            return Err(StatsError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Send one request and wait for the response carrying the same id.
    async fn exchange(&mut self, method: &str, params: Value) -> Result<Value, StatsError> {
        let id = self.alloc_id();
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.send(&request).await?;
        loop {
            let msg = self.recv().await?;
            if msg.get("id").and_then(Value::as_u64) != Some(id) {
                if let Some(text) = msg.pointer("/params/message").and_then(Value::as_str) {
                    tracing::debug!("statistics engine: {text}");
                }
                continue;
            }
            if let Some(err) = msg.get("error") {
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(StatsError::Evaluation {
                    expression: describe(method, &request["params"]),
                    message,
                });
            }
            return Ok(msg.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    /// [`Self::exchange`] bounded by the request timeout. Transport failures
    /// and timeouts poison the connection; evaluation errors do not.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value, StatsError> {
        if self.broken {
            return Err(StatsError::Closed);
        }
        let result = match tokio::time::timeout(self.request_timeout, self.exchange(method, params))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StatsError::Timeout(self.request_timeout)),
        };
        if let Err(e) = &result {
            if !matches!(e, StatsError::Evaluation { .. }) {
                self.broken = true;
            }
        }
        result
    }
}

fn describe(method: &str, params: &Value) -> String {
    params
        .get("expression")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| method.to_string())
}

#[async_trait]
impl StatsConnection for ProcessConnection {
    async fn assign(&mut self, name: &str, value: &StatsVector) -> Result<(), StatsError> {
        let mut params = serde_json::to_value(value)?;
        params["name"] = Value::String(name.to_string());
        self.call("assign", params).await.map(drop)
    }

    async fn eval(&mut self, expression: &str) -> Result<StatsValue, StatsError> {
        let result = self.call("eval", json!({ "expression": expression })).await?;
        StatsValue::from_wire(result)
    }

    async fn eval_assign(&mut self, name: &str, expression: &str) -> Result<(), StatsError> {
        self.call(
            "assign_eval",
            json!({ "name": name, "expression": expression }),
        )
        .await
        .map(drop)
    }

    async fn remove(&mut self, names: &[String]) -> Result<(), StatsError> {
        self.call("remove", json!({ "names": names })).await.map(drop)
    }

    fn is_alive(&mut self) -> bool {
        if self.broken {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }
}

// ─── Factory ────────────────────────────────────────────────────────

pub struct ProcessConnectionFactory {
    command: EngineCommand,
}

impl ProcessConnectionFactory {
    pub fn new(command: EngineCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ConnectionFactory for ProcessConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn StatsConnection>, StatsError> {
        let conn = ProcessConnection::spawn(&self.command).await?;
        Ok(Box::new(conn))
    }
}
