//! Kernel tool handlers

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::tools::{
    create_error_response, create_json_success_response, create_success_response,
    extract_optional_param, extract_param, ToolHandler,
};
use super::types::{CallToolResponse, Tool};
use crate::bridge::KernelBridge;
use crate::error::Result;

/// Execute code on the connected kernel and return the aggregated result.
pub struct ExecuteCodeTool;

#[async_trait]
impl ToolHandler for ExecuteCodeTool {
    async fn call(
        &self,
        bridge: &KernelBridge,
        arguments: Option<Value>,
    ) -> Result<CallToolResponse> {
        let code: String = extract_param(&arguments, "code")?;
        let timeout_ms: Option<u64> = extract_optional_param(&arguments, "timeout_ms")?;
        let timeout = timeout_ms.map(Duration::from_millis);

        info!("Executing code ({} bytes)", code.len());
        match bridge.execute_code(&code, timeout).await {
            // A kernel-side exception is still a valid aggregated result;
            // only transport-level failures become tool errors.
            Ok(result) => Ok(create_json_success_response(serde_json::to_value(result)?)),
            Err(e) => {
                warn!("Execute failed: {}", e);
                Ok(create_error_response(&format!("Execution failed: {}", e)))
            }
        }
    }

    fn definition(&self) -> Tool {
        Tool {
            name: "execute_code".to_string(),
            description: "Execute code on the connected kernel and return status, ordered outputs, and any error descriptor".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "code": {"type": "string", "description": "Code to execute"},
                    "timeout_ms": {"type": "integer", "description": "Execution timeout in milliseconds"}
                },
                "required": ["code"]
            }),
        }
    }
}

/// Send an interrupt to break out of long-running kernel code.
pub struct InterruptKernelTool;

#[async_trait]
impl ToolHandler for InterruptKernelTool {
    async fn call(
        &self,
        bridge: &KernelBridge,
        _arguments: Option<Value>,
    ) -> Result<CallToolResponse> {
        match bridge.interrupt() {
            Ok(()) => Ok(create_success_response("Interrupt sent to kernel")),
            Err(e) => Ok(create_error_response(&format!(
                "Failed to interrupt kernel: {}",
                e
            ))),
        }
    }

    fn definition(&self) -> Tool {
        Tool {
            name: "interrupt_kernel".to_string(),
            description: "Interrupt the currently running kernel computation".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }
}

/// Restart the kernel via the protocol, resetting its namespace.
pub struct RestartKernelTool;

#[async_trait]
impl ToolHandler for RestartKernelTool {
    async fn call(
        &self,
        bridge: &KernelBridge,
        _arguments: Option<Value>,
    ) -> Result<CallToolResponse> {
        match bridge.restart().await {
            Ok(()) => Ok(create_success_response("Kernel restart acknowledged")),
            Err(e) => Ok(create_error_response(&format!(
                "Failed to restart kernel: {}",
                e
            ))),
        }
    }

    fn definition(&self) -> Tool {
        Tool {
            name: "restart_kernel".to_string(),
            description: "Restart the kernel, clearing its execution state".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }
}

/// Report kernel busy/idle state, execution count, and bridge diagnostics.
pub struct KernelStatusTool;

#[async_trait]
impl ToolHandler for KernelStatusTool {
    async fn call(
        &self,
        bridge: &KernelBridge,
        _arguments: Option<Value>,
    ) -> Result<CallToolResponse> {
        let snapshot = bridge.status();
        let response = json!({
            "execution_state": snapshot.execution_state,
            "execution_count": snapshot.execution_count,
            "reachable": snapshot.reachable,
            "unrouted_messages": bridge.unrouted_count(),
        });
        Ok(create_json_success_response(response))
    }

    fn definition(&self) -> Tool {
        Tool {
            name: "kernel_status".to_string(),
            description: "Get kernel busy/idle state, execution count, and bridge diagnostics"
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }
}
