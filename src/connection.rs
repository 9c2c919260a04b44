//! Kernel connection descriptor
//!
//! The bridge consumes a standard Jupyter-style connection file: transport
//! addresses for the five channels, the HMAC signing key, and the signature
//! scheme. The descriptor is read once at startup and never mutated.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::ChannelKind;
use crate::{Error, Result};

/// Environment variable consulted when no explicit connection file is given.
pub const CONNECTION_ENV_VAR: &str = "IPYKERNEL_MCP_CONNECTION";

/// Signature scheme the codec supports.
pub const SIGNATURE_SCHEME: &str = "hmac-sha256";

/// Parsed kernel connection descriptor.
///
/// Immutable once loaded. Unknown fields in the source document are ignored
/// rather than rejected so newer kernels can extend the format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_signature_scheme() -> String {
    SIGNATURE_SCHEME.to_string()
}

/// Resolve the connection file path with priority:
/// explicit parameter > environment variable > provided default.
pub fn resolve_connection_file(
    explicit: Option<&Path>,
    default: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(env_path) = std::env::var(CONNECTION_ENV_VAR) {
        if !env_path.is_empty() {
            return Ok(PathBuf::from(env_path));
        }
    }

    default.map(Path::to_path_buf).ok_or_else(|| {
        Error::Connection(format!(
            "no connection file given and {} is not set",
            CONNECTION_ENV_VAR
        ))
    })
}

impl ConnectionInfo {
    /// Load and validate a connection descriptor from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Connection(format!(
                "failed to read connection file {}: {}",
                path.display(),
                e
            ))
        })?;

        let info: ConnectionInfo = serde_json::from_str(&raw)?;
        info.validate()?;
        debug!(
            "Loaded connection descriptor for {}:{} from {}",
            info.ip,
            info.shell_port,
            path.display()
        );
        Ok(info)
    }

    /// Validate that all required channel addresses are present and the
    /// signature scheme is one the codec can produce.
    pub fn validate(&self) -> Result<()> {
        if self.ip.is_empty() {
            return Err(Error::Connection(
                "connection descriptor has no kernel address".to_string(),
            ));
        }

        for (name, port) in [
            ("shell", self.shell_port),
            ("iopub", self.iopub_port),
            ("stdin", self.stdin_port),
            ("control", self.control_port),
            ("hb", self.hb_port),
        ] {
            if port == 0 {
                return Err(Error::Connection(format!(
                    "connection descriptor is missing the {} channel port",
                    name
                )));
            }
        }

        if !self.key.is_empty() && self.signature_scheme != SIGNATURE_SCHEME {
            return Err(Error::Connection(format!(
                "unsupported signature scheme: {}",
                self.signature_scheme
            )));
        }

        Ok(())
    }

    /// Socket address for one channel.
    pub fn addr(&self, channel: ChannelKind) -> String {
        let port = match channel {
            ChannelKind::Shell => self.shell_port,
            ChannelKind::IoPub => self.iopub_port,
            ChannelKind::Stdin => self.stdin_port,
            ChannelKind::Control => self.control_port,
            ChannelKind::Heartbeat => self.hb_port,
        };
        format!("{}:{}", self.ip, port)
    }
}
