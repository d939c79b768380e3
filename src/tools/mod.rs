// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Tool and server descriptors, plus the unified tool manager.
//!
//! A [`ServerDescriptor`] names a tool server and its transport; a
//! [`ToolDescriptor`] is one discovered tool enriched with timeout and
//! fallback configuration. The [`manager::ToolManager`] owns the registry
//! and every dispatch.

pub mod manager;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DEFAULT_TOOL_TIMEOUT;

/// Transport-specific connection record for a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportKind {
    /// Subprocess with newline-delimited JSON-RPC over stdio.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Command arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Server-sent event channel with a POSTed request endpoint.
    EventStream {
        /// Stream URL.
        url: String,
        /// HTTP headers sent with every request.
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// A configured tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name.
    pub name: String,
    /// Transport kind and connection record.
    pub transport: TransportKind,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled servers are skipped at registration.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerDescriptor {
    /// A stdio server descriptor.
    #[must_use]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            description: None,
            enabled: true,
        }
    }

    /// An event-stream server descriptor.
    #[must_use]
    pub fn event_stream(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::EventStream {
                url: url.into(),
                headers: HashMap::new(),
            },
            description: None,
            enabled: true,
        }
    }
}

/// One tool in the discovery cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    /// Owning server.
    pub server: String,
    /// Tool description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for arguments.
    pub input_schema: Value,
    /// JSON Schema for results, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Execution timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Ordered fallback tool names tried on persistent failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_tools: Vec<String>,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TOOL_TIMEOUT.as_secs()
}

impl ToolDescriptor {
    /// `server:tool` key used by the discovery cache.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.server, self.name)
    }

    /// Whether a fallback list is configured.
    #[must_use]
    pub fn has_fallback(&self) -> bool {
        !self.fallback_tools.is_empty()
    }

    /// The execution timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Per-tool configuration applied on top of discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverride {
    /// Replacement timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Replacement fallback list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_tools: Option<Vec<String>>,
}
