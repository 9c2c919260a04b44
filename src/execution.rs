//! Execution coordination
//!
//! Issues execute requests, collects the asynchronous burst of output
//! correlated to each request, and flattens it into one [`AggregateResult`].
//! Requests are serialized: the kernel protocol gives no way to disambiguate
//! overlapping shell requests, so a new `execute` call queues behind an
//! in-flight one (tokio's mutex wakes waiters in FIFO order).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::mux::ChannelMultiplexer;
use crate::session::SessionState;
use crate::transport::ChannelKind;
use crate::wire::{msg_types, WireMessage};
use crate::{Error, Result};

/// Outcome classification of one execute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Aborted,
}

/// Structured descriptor of a kernel-side exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

/// One output fragment, in wire arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Output {
    /// stdout/stderr text.
    Stream { name: String, text: String },
    /// Rich display payload keyed by MIME type.
    DisplayData { data: Map<String, Value> },
    /// The expression result value, keyed by MIME type.
    ExecuteResult {
        data: Map<String, Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_count: Option<u64>,
    },
    /// A raised exception with its traceback.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// Forward-compatibility escape hatch: unrecognized message types are
    /// surfaced, never rejected.
    Unknown { msg_type: String, content: Value },
}

/// The flattened outcome of one execute call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub status: ExecutionStatus,
    pub outputs: Vec<Output>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<u64>,
}

/// Correlates execute requests with their asynchronous output.
pub struct ExecutionCoordinator {
    mux: ChannelMultiplexer,
    session: Arc<SessionState>,
    session_id: String,
    shell_slot: tokio::sync::Mutex<()>,
}

impl ExecutionCoordinator {
    pub fn new(mux: ChannelMultiplexer, session: Arc<SessionState>, session_id: String) -> Self {
        Self {
            mux,
            session,
            session_id,
            shell_slot: tokio::sync::Mutex::new(()),
        }
    }

    /// Execute `code` on the kernel, collecting all correlated output until
    /// the terminal `execute_reply` arrives or `timeout` elapses.
    ///
    /// On timeout a best-effort interrupt is sent on the control channel and
    /// the call returns immediately with status `aborted` and whatever output
    /// had accumulated; late messages for the abandoned key are absorbed by
    /// the multiplexer's tombstone window.
    pub async fn execute(&self, code: &str, timeout: Duration) -> Result<AggregateResult> {
        let _slot = self.shell_slot.lock().await;

        let request = WireMessage::execute_request(&self.session_id, code);
        let mut reg = self.mux.register(request.msg_id())?;
        self.mux.send(ChannelKind::Shell, &request)?;
        debug!("Sent execute_request {}", request.msg_id());

        let deadline = Instant::now() + timeout;
        let mut outputs = Vec::new();
        let mut error = None;

        loop {
            let arrival = match timeout_at(deadline, reg.recv()).await {
                Err(_) => {
                    warn!(
                        "Execute request {} timed out after {:?}; interrupting",
                        request.msg_id(),
                        timeout
                    );
                    self.send_interrupt();
                    // Fragments that raced the deadline are already queued;
                    // partial output is still part of the aborted result.
                    while let Some(queued) = reg.try_recv() {
                        collect_output(queued.message, &mut outputs, &mut error);
                    }
                    return Ok(AggregateResult {
                        status: ExecutionStatus::Aborted,
                        outputs,
                        error,
                        execution_count: None,
                    });
                }
                Ok(None) => {
                    return Err(Error::Connection(
                        "connection lost while waiting for execute reply".to_string(),
                    ))
                }
                Ok(Some(arrival)) => arrival,
            };

            let is_terminal = arrival.channel == ChannelKind::Shell
                && arrival.message.msg_type() == msg_types::EXECUTE_REPLY;
            if is_terminal {
                // Output already queued behind the reply still belongs to
                // this execution; drain it before building the result.
                while let Some(queued) = reg.try_recv() {
                    collect_output(queued.message, &mut outputs, &mut error);
                }
                return Ok(self.finish(arrival.message, outputs, error));
            }

            collect_output(arrival.message, &mut outputs, &mut error);
        }
    }

    /// Fire-and-forget interrupt on the control channel; the reply is
    /// pre-tombstoned so it never counts as unrouted.
    pub fn interrupt(&self) -> Result<()> {
        let request = WireMessage::interrupt_request(&self.session_id);
        self.mux.expect_discard(request.msg_id());
        self.mux.send(ChannelKind::Control, &request)?;
        info!("Sent interrupt_request {}", request.msg_id());
        Ok(())
    }

    /// Ask the kernel to restart (shutdown with `restart: true`) and reset
    /// the local session counters once it acknowledges.
    pub async fn restart(&self, timeout: Duration) -> Result<()> {
        let request = WireMessage::shutdown_request(&self.session_id, true);
        let mut reg = self.mux.register(request.msg_id())?;
        self.mux.send(ChannelKind::Control, &request)?;
        info!("Sent shutdown_request (restart) {}", request.msg_id());

        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, reg.recv()).await {
                Err(_) => {
                    return Err(Error::KernelUnresponsive(
                        "kernel did not acknowledge restart".to_string(),
                    ))
                }
                Ok(None) => {
                    return Err(Error::Connection(
                        "connection lost while waiting for restart reply".to_string(),
                    ))
                }
                Ok(Some(arrival))
                    if arrival.message.msg_type() == msg_types::SHUTDOWN_REPLY =>
                {
                    self.session.reset();
                    info!("Kernel acknowledged restart");
                    return Ok(());
                }
                Ok(Some(_)) => continue,
            }
        }
    }

    fn send_interrupt(&self) {
        if let Err(e) = self.interrupt() {
            warn!("Best-effort interrupt failed: {}", e);
        }
    }

    fn finish(
        &self,
        reply: WireMessage,
        outputs: Vec<Output>,
        collected_error: Option<ErrorDetail>,
    ) -> AggregateResult {
        let execution_count = reply
            .content
            .get("execution_count")
            .and_then(Value::as_u64);
        if let Some(count) = execution_count {
            // The counter moves only on the kernel's own acknowledgment.
            self.session.observe_execution_count(count);
        }

        let status = match reply.content_str("status") {
            Some("ok") => ExecutionStatus::Ok,
            Some("aborted") => ExecutionStatus::Aborted,
            _ => ExecutionStatus::Error,
        };

        let error = match status {
            ExecutionStatus::Ok => None,
            _ => collected_error.or_else(|| error_detail(&reply.content)),
        };

        AggregateResult {
            status,
            outputs,
            error,
            execution_count,
        }
    }
}

/// Classify one correlated message into an output fragment. Arrival order is
/// preserved; status broadcasts are already consumed by the session tracker.
fn collect_output(msg: WireMessage, outputs: &mut Vec<Output>, error: &mut Option<ErrorDetail>) {
    match msg.msg_type() {
        msg_types::STREAM => outputs.push(Output::Stream {
            name: msg
                .content_str("name")
                .unwrap_or("stdout")
                .to_string(),
            text: msg.content_str("text").unwrap_or_default().to_string(),
        }),
        msg_types::DISPLAY_DATA => outputs.push(Output::DisplayData {
            data: mime_bundle(&msg.content),
        }),
        msg_types::EXECUTE_RESULT => outputs.push(Output::ExecuteResult {
            data: mime_bundle(&msg.content),
            execution_count: msg.content.get("execution_count").and_then(Value::as_u64),
        }),
        msg_types::ERROR => {
            let detail = error_detail(&msg.content).unwrap_or_else(|| ErrorDetail {
                ename: "Error".to_string(),
                evalue: String::new(),
                traceback: Vec::new(),
            });
            outputs.push(Output::Error {
                ename: detail.ename.clone(),
                evalue: detail.evalue.clone(),
                traceback: detail.traceback.clone(),
            });
            *error = Some(detail);
        }
        msg_types::STATUS => {}
        other => outputs.push(Output::Unknown {
            msg_type: other.to_string(),
            content: msg.content,
        }),
    }
}

fn mime_bundle(content: &Value) -> Map<String, Value> {
    content
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn error_detail(content: &Value) -> Option<ErrorDetail> {
    let ename = content.get("ename").and_then(Value::as_str)?;
    ErrorDetail {
        ename: ename.to_string(),
        evalue: content
            .get("evalue")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        traceback: content
            .get("traceback")
            .and_then(Value::as_array)
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
    .into()
}
