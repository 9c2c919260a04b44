//! Tool adapter boundary
//!
//! Translates external tool-call parameters into bridge operations and
//! aggregated results back into tool-call responses. This is the only module
//! the outward tool-invocation layer sees; it never touches the wire
//! protocol directly.

pub mod kernel_tools;
pub mod tools;
pub mod types;

pub use tools::{ToolHandler, ToolRegistry};
pub use types::{CallToolRequest, CallToolResponse, Tool, ToolContent};

use kernel_tools::{ExecuteCodeTool, InterruptKernelTool, KernelStatusTool, RestartKernelTool};

/// Registry pre-populated with the kernel tools.
pub fn kernel_tool_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(ExecuteCodeTool);
    registry.register(InterruptKernelTool);
    registry.register(RestartKernelTool);
    registry.register(KernelStatusTool);
    registry
}
