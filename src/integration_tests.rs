//! End-to-end bridge tests against a scripted in-process kernel.
//!
//! The fake kernel speaks the real wire protocol over in-memory channel
//! sockets: signed frames, busy/idle status broadcasts, parented output, and
//! terminal replies. These tests exercise the codec, multiplexer,
//! coordinator, and tool layer together.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use crate::bridge::KernelBridge;
use crate::codec::MessageCodec;
use crate::config::BridgeConfig;
use crate::execution::{ExecutionStatus, Output};
use crate::mcp::{kernel_tool_registry, CallToolRequest};
use crate::mux::ChannelSet;
use crate::session::ExecutionState;
use crate::transport::InMemoryChannelSocket;
use crate::wire::{msg_types, WireMessage};
use crate::Error;

const KEY: &str = "integration-key";

fn test_config() -> BridgeConfig {
    BridgeConfig {
        heartbeat_interval: Duration::from_millis(25),
        heartbeat_timeout: Duration::from_millis(100),
        heartbeat_grace: Duration::from_millis(500),
        missed_heartbeat_limit: 3,
        tombstone_retention: Duration::from_secs(5),
        default_execute_timeout: Duration::from_secs(2),
    }
}

/// Kernel side of the shell and iopub channels, scripted by code string.
struct FakeKernel {
    shell: InMemoryChannelSocket,
    iopub: InMemoryChannelSocket,
    codec: MessageCodec,
    execution_count: u64,
}

impl FakeKernel {
    async fn serve(mut self) {
        while let Ok(frames) = self.shell.recv().await {
            let request = match self.codec.decode(&frames) {
                Ok(request) => request,
                Err(_) => continue,
            };
            self.publish(
                &request,
                msg_types::STATUS,
                json!({"execution_state": "busy"}),
            )
            .await;

            let code = request.content_str("code").unwrap_or_default().to_string();
            self.handle(&request, &code).await;
        }
    }

    async fn handle(&mut self, request: &WireMessage, code: &str) {
        match code {
            "1+1" => {
                self.execution_count += 1;
                let count = self.execution_count;
                self.publish(
                    request,
                    msg_types::EXECUTE_RESULT,
                    json!({"data": {"text/plain": "2"}, "execution_count": count}),
                )
                .await;
                self.idle_and_reply_ok(request, count).await;
            }
            "raise ValueError('x')" => {
                self.execution_count += 1;
                let count = self.execution_count;
                let error = json!({
                    "ename": "ValueError",
                    "evalue": "x",
                    "traceback": ["Traceback (most recent call last):", "ValueError: x"]
                });
                self.publish(request, msg_types::ERROR, error.clone()).await;
                self.publish(
                    request,
                    msg_types::STATUS,
                    json!({"execution_state": "idle"}),
                )
                .await;
                let mut reply = error;
                reply["status"] = json!("error");
                reply["execution_count"] = json!(count);
                self.reply(request, reply).await;
            }
            "print('hi'); 1/0" => {
                self.execution_count += 1;
                let count = self.execution_count;
                self.publish(
                    request,
                    msg_types::STREAM,
                    json!({"name": "stdout", "text": "hi\n"}),
                )
                .await;
                let error = json!({
                    "ename": "ZeroDivisionError",
                    "evalue": "division by zero",
                    "traceback": ["ZeroDivisionError: division by zero"]
                });
                self.publish(request, msg_types::ERROR, error.clone()).await;
                self.publish(
                    request,
                    msg_types::STATUS,
                    json!({"execution_state": "idle"}),
                )
                .await;
                let mut reply = error;
                reply["status"] = json!("error");
                reply["execution_count"] = json!(count);
                self.reply(request, reply).await;
            }
            // Hangs forever: busy was broadcast, no reply ever comes.
            "while True: pass" => {}
            // Emits one line of output, then hangs without a reply.
            "print('partial'); hang()" => {
                self.publish(
                    request,
                    msg_types::STREAM,
                    json!({"name": "stdout", "text": "partial\n"}),
                )
                .await;
            }
            // Emits a stray output parented to a request the bridge never
            // made, then answers normally.
            "leaky" => {
                let foreign = WireMessage::execute_request("other-session", "stray");
                self.publish(
                    &foreign,
                    msg_types::STREAM,
                    json!({"name": "stdout", "text": "stray\n"}),
                )
                .await;
                self.execution_count += 1;
                let count = self.execution_count;
                self.publish(
                    request,
                    msg_types::EXECUTE_RESULT,
                    json!({"data": {"text/plain": "5"}, "execution_count": count}),
                )
                .await;
                self.idle_and_reply_ok(request, count).await;
            }
            _ => {
                self.execution_count += 1;
                let count = self.execution_count;
                self.idle_and_reply_ok(request, count).await;
            }
        }
    }

    async fn idle_and_reply_ok(&mut self, request: &WireMessage, count: u64) {
        self.publish(
            request,
            msg_types::STATUS,
            json!({"execution_state": "idle"}),
        )
        .await;
        self.reply(
            request,
            json!({"status": "ok", "execution_count": count, "user_expressions": {}}),
        )
        .await;
    }

    async fn publish(&mut self, parent: &WireMessage, msg_type: &str, content: Value) {
        let msg = WireMessage::child(parent, msg_type, content);
        let frames = self.codec.encode(&msg).expect("encode iopub message");
        self.iopub.send(frames).await.expect("iopub send");
    }

    async fn reply(&mut self, parent: &WireMessage, content: Value) {
        // Queued iopub output gets a head start so output assertions do not
        // race the terminal reply across channels.
        sleep(Duration::from_millis(20)).await;
        let msg = WireMessage::child(parent, msg_types::EXECUTE_REPLY, content);
        let frames = self.codec.encode(&msg).expect("encode shell reply");
        self.shell.send(frames).await.expect("shell send");
    }
}

/// Kernel side of the control channel: records interrupts, acknowledges
/// shutdowns.
async fn serve_control(
    mut control: InMemoryChannelSocket,
    codec: MessageCodec,
    interrupts: mpsc::UnboundedSender<WireMessage>,
) {
    while let Ok(frames) = control.recv().await {
        let request = match codec.decode(&frames) {
            Ok(request) => request,
            Err(_) => continue,
        };
        match request.msg_type() {
            msg_types::INTERRUPT_REQUEST => {
                let _ = interrupts.send(request);
            }
            msg_types::SHUTDOWN_REQUEST => {
                let reply = WireMessage::child(
                    &request,
                    msg_types::SHUTDOWN_REPLY,
                    json!({"status": "ok", "restart": request.content["restart"]}),
                );
                let frames = codec.encode(&reply).expect("encode shutdown reply");
                if control.send(frames).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
}

struct Harness {
    bridge: KernelBridge,
    interrupts: mpsc::UnboundedReceiver<WireMessage>,
}

/// Route bridge logs through the test writer; `RUST_LOG` controls verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_kernel() -> Harness {
    init_tracing();

    let (shell_b, shell_k) = InMemoryChannelSocket::pair();
    let (control_b, control_k) = InMemoryChannelSocket::pair();
    let (stdin_b, stdin_k) = InMemoryChannelSocket::pair();
    let (iopub_b, iopub_k) = InMemoryChannelSocket::pair();
    let (hb_b, mut hb_k) = InMemoryChannelSocket::pair();

    tokio::spawn(
        FakeKernel {
            shell: shell_k,
            iopub: iopub_k,
            codec: MessageCodec::from_key(KEY),
            execution_count: 0,
        }
        .serve(),
    );

    let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve_control(
        control_k,
        MessageCodec::from_key(KEY),
        interrupt_tx,
    ));

    tokio::spawn(async move {
        while let Ok(frames) = hb_k.recv().await {
            if hb_k.send(frames).await.is_err() {
                break;
            }
        }
    });

    // The stdin channel carries nothing in these tests; keep the kernel end
    // open so the bridge does not observe a closed socket.
    tokio::spawn(async move {
        let _keep = stdin_k;
        std::future::pending::<()>().await;
    });

    let bridge = KernelBridge::connect_with(
        MessageCodec::from_key(KEY),
        ChannelSet {
            shell: Box::new(shell_b),
            control: Box::new(control_b),
            stdin: Box::new(stdin_b),
            iopub: Box::new(iopub_b),
        },
        Box::new(hb_b),
        test_config(),
    )
    .await
    .expect("bridge should connect");

    Harness {
        bridge,
        interrupts: interrupt_rx,
    }
}

#[tokio::test]
async fn executes_simple_expression_end_to_end() {
    let harness = start_kernel().await;

    let result = harness.bridge.execute_code("1+1", None).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.execution_count, Some(1));
    assert!(result.error.is_none());
    assert_eq!(result.outputs.len(), 1);
    match &result.outputs[0] {
        Output::ExecuteResult {
            data,
            execution_count,
        } => {
            assert_eq!(data["text/plain"], json!("2"));
            assert_eq!(*execution_count, Some(1));
        }
        other => panic!("expected execute_result output, got {:?}", other),
    }
    assert_eq!(harness.bridge.status().execution_count, 1);
    assert_eq!(harness.bridge.unrouted_count(), 0);
}

#[tokio::test]
async fn raised_exception_reports_error_detail() {
    let harness = start_kernel().await;

    let result = harness
        .bridge
        .execute_code("raise ValueError('x')", None)
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Error);
    let detail = result.error.expect("error detail");
    assert_eq!(detail.ename, "ValueError");
    assert_eq!(detail.evalue, "x");
    assert!(!detail.traceback.is_empty());
    assert!(result
        .outputs
        .iter()
        .any(|out| matches!(out, Output::Error { ename, .. } if ename == "ValueError")));
}

#[tokio::test]
async fn stream_output_precedes_failure() {
    let harness = start_kernel().await;

    let result = harness
        .bridge
        .execute_code("print('hi'); 1/0", None)
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.outputs.len(), 2);
    assert!(
        matches!(&result.outputs[0], Output::Stream { name, text } if name == "stdout" && text == "hi\n")
    );
    assert!(
        matches!(&result.outputs[1], Output::Error { ename, .. } if ename == "ZeroDivisionError")
    );
    assert_eq!(result.error.unwrap().evalue, "division by zero");
}

#[tokio::test]
async fn timeout_aborts_interrupts_and_frees_the_slot() {
    let mut harness = start_kernel().await;

    let started = Instant::now();
    let result = harness
        .bridge
        .execute_code("while True: pass", Some(Duration::from_millis(150)))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.status, ExecutionStatus::Aborted);
    assert!(result.outputs.is_empty());

    let interrupt = timeout(Duration::from_secs(1), harness.interrupts.recv())
        .await
        .expect("interrupt should arrive on control")
        .unwrap();
    assert_eq!(interrupt.msg_type(), msg_types::INTERRUPT_REQUEST);

    // The serialization slot is released; a later request is unaffected.
    let next = harness.bridge.execute_code("1+1", None).await.unwrap();
    assert_eq!(next.status, ExecutionStatus::Ok);
    assert_eq!(harness.bridge.unrouted_count(), 0);
}

#[tokio::test]
async fn timeout_keeps_output_that_preceded_the_deadline() {
    let harness = start_kernel().await;

    let result = harness
        .bridge
        .execute_code("print('partial'); hang()", Some(Duration::from_millis(200)))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Aborted);
    assert!(
        matches!(&result.outputs[0], Output::Stream { name, text } if name == "stdout" && text == "partial\n"),
        "aborted result should keep the partial output, got {:?}",
        result.outputs
    );
}

#[tokio::test]
async fn foreign_parented_output_is_never_delivered() {
    let harness = start_kernel().await;

    let result = harness.bridge.execute_code("leaky", None).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.outputs.len(), 1);
    assert!(matches!(
        &result.outputs[0],
        Output::ExecuteResult { data, .. } if data["text/plain"] == json!("5")
    ));

    // The stray fragment shows up only as a diagnostic.
    timeout(Duration::from_secs(1), async {
        while harness.bridge.unrouted_count() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stray output should be counted as unrouted");
    assert_eq!(harness.bridge.unrouted_count(), 1);
}

#[tokio::test]
async fn concurrent_executes_are_serialized() {
    let harness = start_kernel().await;
    let bridge = Arc::new(harness.bridge);

    let first = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.execute_code("1+1", None).await })
    };
    let second = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.execute_code("1+1", None).await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.status, ExecutionStatus::Ok);
    assert_eq!(second.status, ExecutionStatus::Ok);
    // Each call saw exactly its own output, and the kernel counted two
    // distinct executions.
    assert_eq!(first.outputs.len(), 1);
    assert_eq!(second.outputs.len(), 1);
    let mut counts = vec![first.execution_count, second.execution_count];
    counts.sort();
    assert_eq!(counts, vec![Some(1), Some(2)]);
    assert_eq!(bridge.unrouted_count(), 0);
}

#[tokio::test]
async fn status_broadcasts_drive_busy_idle_tracking() {
    let harness = start_kernel().await;
    assert_eq!(
        harness.bridge.status().execution_state,
        ExecutionState::Starting
    );

    harness.bridge.execute_code("1+1", None).await.unwrap();

    timeout(Duration::from_secs(1), async {
        while harness.bridge.status().execution_state != ExecutionState::Idle {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("idle broadcast should be observed");
}

#[tokio::test]
async fn restart_resets_session_counters() {
    let harness = start_kernel().await;

    harness.bridge.execute_code("1+1", None).await.unwrap();
    assert_eq!(harness.bridge.status().execution_count, 1);

    harness.bridge.restart().await.unwrap();

    let snapshot = harness.bridge.status();
    assert_eq!(snapshot.execution_count, 0);
    assert_eq!(snapshot.execution_state, ExecutionState::Starting);
}

#[tokio::test]
async fn close_fails_subsequent_executes() {
    let harness = start_kernel().await;
    harness.bridge.close();

    let err = harness
        .bridge
        .execute_code("1+1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
}

#[tokio::test]
async fn tool_layer_round_trips_execute_and_status() {
    let harness = start_kernel().await;
    let registry = kernel_tool_registry();

    let response = registry
        .call_tool(
            &harness.bridge,
            CallToolRequest {
                name: "execute_code".to_string(),
                arguments: Some(json!({"code": "1+1"})),
            },
        )
        .await
        .unwrap();
    assert!(response.is_error.is_none());
    let payload: Value = serde_json::from_str(&response.content[0].text).unwrap();
    assert_eq!(payload["status"], json!("ok"));
    assert_eq!(payload["outputs"][0]["kind"], json!("execute_result"));
    assert_eq!(payload["execution_count"], json!(1));

    let status = registry
        .call_tool(
            &harness.bridge,
            CallToolRequest {
                name: "kernel_status".to_string(),
                arguments: None,
            },
        )
        .await
        .unwrap();
    let payload: Value = serde_json::from_str(&status.content[0].text).unwrap();
    assert_eq!(payload["execution_count"], json!(1));
    assert_eq!(payload["reachable"], json!(true));

    let missing = registry
        .call_tool(
            &harness.bridge,
            CallToolRequest {
                name: "no_such_tool".to_string(),
                arguments: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(missing.is_error, Some(true));
}

#[tokio::test]
async fn kernel_exception_is_a_tool_success_with_error_status() {
    let harness = start_kernel().await;
    let registry = kernel_tool_registry();

    let response = registry
        .call_tool(
            &harness.bridge,
            CallToolRequest {
                name: "execute_code".to_string(),
                arguments: Some(json!({"code": "raise ValueError('x')"})),
            },
        )
        .await
        .unwrap();

    // A kernel-side exception is a successful tool call whose payload says
    // so; only transport failures flag the response as an error.
    assert!(response.is_error.is_none());
    let payload: Value = serde_json::from_str(&response.content[0].text).unwrap();
    assert_eq!(payload["status"], json!("error"));
    assert_eq!(payload["error"]["ename"], json!("ValueError"));
}
