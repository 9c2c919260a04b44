//! Tool registry and dispatch

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use super::types::{CallToolRequest, CallToolResponse, Tool, ToolContent};
use crate::bridge::KernelBridge;
use crate::error::{Error, Result};

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, bridge: &KernelBridge, arguments: Option<Value>)
        -> Result<CallToolResponse>;
    fn definition(&self) -> Tool;
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register<T: ToolHandler + 'static>(&mut self, tool: T) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, Box::new(tool));
    }

    pub fn get_tool(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.tools.get(name).map(Box::as_ref)
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    pub async fn call_tool(
        &self,
        bridge: &KernelBridge,
        request: CallToolRequest,
    ) -> Result<CallToolResponse> {
        match self.get_tool(&request.name) {
            Some(tool) => tool.call(bridge, request.arguments).await,
            None => Ok(create_error_response(&format!(
                "Tool '{}' not found",
                request.name
            ))),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create_success_response(message: &str) -> CallToolResponse {
    CallToolResponse {
        content: vec![ToolContent {
            content_type: "text".to_string(),
            text: message.to_string(),
        }],
        is_error: None,
    }
}

pub fn create_error_response(error: &str) -> CallToolResponse {
    CallToolResponse {
        content: vec![ToolContent {
            content_type: "text".to_string(),
            text: error.to_string(),
        }],
        is_error: Some(true),
    }
}

pub fn create_json_success_response(value: Value) -> CallToolResponse {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    CallToolResponse {
        content: vec![ToolContent {
            content_type: "text".to_string(),
            text,
        }],
        is_error: None,
    }
}

// Utility functions to extract and validate parameters
pub fn extract_param<T>(arguments: &Option<Value>, key: &str) -> Result<T>
where
    T: for<'de> serde::Deserialize<'de>,
{
    match arguments {
        Some(Value::Object(map)) => match map.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::InvalidParams(format!("Invalid parameter '{}': {}", key, e))),
            None => Err(Error::InvalidParams(format!(
                "Missing required parameter '{}'",
                key
            ))),
        },
        _ => Err(Error::InvalidParams(
            "Arguments must be an object".to_string(),
        )),
    }
}

pub fn extract_optional_param<T>(arguments: &Option<Value>, key: &str) -> Result<Option<T>>
where
    T: for<'de> serde::Deserialize<'de>,
{
    match arguments {
        Some(Value::Object(map)) => match map.get(key) {
            Some(value) if !value.is_null() => {
                let parsed: T = serde_json::from_value(value.clone()).map_err(|e| {
                    Error::InvalidParams(format!("Invalid parameter '{}': {}", key, e))
                })?;
                Ok(Some(parsed))
            }
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}
