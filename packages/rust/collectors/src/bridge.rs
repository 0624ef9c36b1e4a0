//! JSON-lines subprocess bridge.
//!
//! Helper processes (the NLP tagger, the browser automation driver) are
//! spawned once and spoken to over stdin/stdout, one JSON object per line:
//!
//! ```text
//! <- {"type":"ready"}
//! -> {"type":"request","id":"req-1","payload":{...}}
//! <- {"type":"result","id":"req-1","result":{...}}   or
//! <- {"type":"error","id":"req-1","error":"..."}
//! -> {"type":"shutdown"}
//! ```

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

use harvester_shared::{HarvesterError, Result};

/// How long a bridge gets to exit after `shutdown` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Request message sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a, T: Serialize> {
    Request { id: &'a str, payload: &'a T },
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        result: serde_json::Value,
    },
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

/// Handle to a spawned JSON-lines helper process.
///
/// The child is killed if the handle is dropped without [`shutdown`](Self::shutdown).
pub struct JsonLinesBridge {
    name: String,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    request_counter: u64,
    timeout: Duration,
}

impl JsonLinesBridge {
    /// Spawn `argv[0] argv[1..]` and wait for its ready message.
    pub async fn spawn(name: &str, argv: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarvesterError::config(format!("{name} bridge command is empty")))?;

        info!(bridge = name, cmd = %program, "spawning bridge");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarvesterError::Tool(format!(
                    "failed to spawn {name} bridge: {e}. Is `{program}` installed?"
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HarvesterError::Tool(format!("failed to capture {name} bridge stdin")))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            HarvesterError::Tool(format!("failed to capture {name} bridge stdout"))
        })?;

        let mut bridge = Self {
            name: name.to_string(),
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            request_counter: 0,
            timeout,
        };

        bridge.wait_for_ready().await?;
        Ok(bridge)
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        let line = self.read_line().await?;
        match serde_json::from_str::<ResponseMessage>(&line) {
            Ok(ResponseMessage::Ready) => {
                info!(bridge = %self.name, "bridge is ready");
                Ok(())
            }
            _ => Err(HarvesterError::parse(format!(
                "{} bridge: expected ready message, got: {}",
                self.name,
                truncate(&line, 200)
            ))),
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let next = tokio::time::timeout(self.timeout, self.lines.next_line())
            .await
            .map_err(|_| {
                HarvesterError::Tool(format!(
                    "{} bridge did not answer within {}s",
                    self.name,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| HarvesterError::Tool(format!("{} bridge read error: {e}", self.name)))?;

        next.map(|l| l.trim().to_string()).ok_or_else(|| {
            HarvesterError::Tool(format!("{} bridge closed stdout unexpectedly", self.name))
        })
    }

    async fn write_line(&mut self, json: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| HarvesterError::Tool(format!("{} bridge write error: {e}", self.name)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| HarvesterError::Tool(format!("{} bridge flush error: {e}", self.name)))
    }

    /// Send one request and wait for its result.
    pub async fn request<Req, Resp>(&mut self, payload: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let json = serde_json::to_string(&RequestMessage::Request { id: &id, payload })
            .map_err(|e| HarvesterError::parse(format!("failed to serialize request: {e}")))?;
        self.write_line(&json).await?;

        let line = self.read_line().await?;
        let msg: ResponseMessage = serde_json::from_str(&line).map_err(|e| {
            HarvesterError::parse(format!(
                "invalid {} bridge response: {e} (got: {})",
                self.name,
                truncate(&line, 200)
            ))
        })?;

        match msg {
            ResponseMessage::Result { id: resp_id, result } => {
                if resp_id != id {
                    return Err(HarvesterError::parse(format!(
                        "{} bridge answered {resp_id}, expected {id}",
                        self.name
                    )));
                }
                serde_json::from_value(result).map_err(|e| {
                    HarvesterError::parse(format!("unexpected {} bridge result: {e}", self.name))
                })
            }
            ResponseMessage::Error { error, .. } => Err(HarvesterError::Tool(format!(
                "{} bridge: {error}",
                self.name
            ))),
            ResponseMessage::Ready => Err(HarvesterError::parse(format!(
                "unexpected ready message from {} bridge",
                self.name
            ))),
        }
    }

    /// Send shutdown and wait for the bridge to exit, killing it after a grace period.
    pub async fn shutdown(mut self) -> Result<()> {
        let json = serde_json::to_string(&RequestMessage::<()>::Shutdown)
            .map_err(|e| HarvesterError::parse(e.to_string()))?;
        let _ = self.write_line(&json).await;

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(bridge = %self.name, ?status, "bridge exited");
            }
            Ok(Err(e)) => warn!(bridge = %self.name, "bridge wait error: {e}"),
            Err(_) => {
                warn!(bridge = %self.name, "bridge ignored shutdown, killing");
                let _ = self.child.kill().await;
            }
        }
        Ok(())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
