//! Action definitions and execution results
//!
//! An [`ActionDefinition`] is produced by the host once per decision cycle and
//! consumed by exactly one adapter. Its payload is a tagged union keyed by the
//! action kind, so every kind carries only the fields it needs and is checked
//! when the definition is built rather than when an adapter runs it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::{EthosError, Result};

/// Discriminant of an [`ActionPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Outbound HTTP request
    Http,
    /// Subprocess execution
    Process,
    /// Smart-device command
    Device,
    /// Filesystem operation
    File,
    /// Shell script (PowerShell or POSIX shell)
    Powershell,
    /// External application launch
    App,
    /// Browser automation step
    Web,
    /// UI automation step
    Ui,
    /// Host system operation
    System,
    /// Interaction with the user
    Interact,
    /// Host-defined kind
    Custom,
}

impl ActionKind {
    /// Built-in kinds in one-hot order; `Custom` is always last
    pub const ALL: [ActionKind; 11] = [
        ActionKind::Http,
        ActionKind::Process,
        ActionKind::Device,
        ActionKind::File,
        ActionKind::Powershell,
        ActionKind::App,
        ActionKind::Web,
        ActionKind::Ui,
        ActionKind::System,
        ActionKind::Interact,
        ActionKind::Custom,
    ];

    /// Position of this kind inside [`ActionKind::ALL`]
    #[must_use]
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(Self::ALL.len() - 1)
    }

    /// Wire name of the kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Http => "http",
            ActionKind::Process => "process",
            ActionKind::Device => "device",
            ActionKind::File => "file",
            ActionKind::Powershell => "powershell",
            ActionKind::App => "app",
            ActionKind::Web => "web",
            ActionKind::Ui => "ui",
            ActionKind::System => "system",
            ActionKind::Interact => "interact",
            ActionKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem operation carried by a `file` action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    /// Read the file as UTF-8 text
    Read,
    /// Create or truncate the file with `contents`
    Write,
    /// Append `contents` to the file
    Append,
    /// List a directory
    List,
    /// Remove a file
    Delete,
    /// Check whether the path exists
    Exists,
}

/// Kind-specific payload of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    /// Outbound HTTP request
    Http {
        /// Request method, e.g. `GET`
        #[serde(default = "default_method")]
        method: String,
        /// Absolute `http(s)://` URL
        url: String,
        /// Extra request headers
        #[serde(default)]
        headers: BTreeMap<String, String>,
        /// JSON body
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    /// Run a program with arguments
    Process {
        /// Program to execute
        program: String,
        /// Arguments
        #[serde(default)]
        args: Vec<String>,
        /// Working directory
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Send a command to a smart device
    Device {
        /// Device identifier on the hub
        device_id: String,
        /// Command name
        command: String,
        /// Command parameters
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Filesystem operation
    File {
        /// Operation to perform
        op: FileOp,
        /// Target path
        path: PathBuf,
        /// Contents for write and append
        #[serde(default)]
        contents: Option<String>,
    },
    /// Shell script
    Powershell {
        /// Script source
        script: String,
    },
    /// Launch an external application
    App {
        /// Application binary or registered name
        app: String,
        /// Launch arguments
        #[serde(default)]
        args: Vec<String>,
    },
    /// Browser automation step
    Web {
        /// Page to act on
        url: String,
        /// Automation instructions
        #[serde(default)]
        instructions: serde_json::Value,
    },
    /// UI automation step
    Ui {
        /// Element or window selector
        target: String,
        /// Input to deliver
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Host system operation
    System {
        /// Operation name
        command: String,
        /// Operation parameters
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Interaction with the user
    Interact {
        /// Message shown to the user
        prompt: String,
        /// Additional data
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Host-defined action kind
    Custom {
        /// Kind name used by host adapters to claim the action
        kind: String,
        /// Opaque payload
        #[serde(default)]
        data: serde_json::Value,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

impl ActionPayload {
    /// Kind of this payload
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Http { .. } => ActionKind::Http,
            ActionPayload::Process { .. } => ActionKind::Process,
            ActionPayload::Device { .. } => ActionKind::Device,
            ActionPayload::File { .. } => ActionKind::File,
            ActionPayload::Powershell { .. } => ActionKind::Powershell,
            ActionPayload::App { .. } => ActionKind::App,
            ActionPayload::Web { .. } => ActionKind::Web,
            ActionPayload::Ui { .. } => ActionKind::Ui,
            ActionPayload::System { .. } => ActionKind::System,
            ActionPayload::Interact { .. } => ActionKind::Interact,
            ActionPayload::Custom { .. } => ActionKind::Custom,
        }
    }

    /// Check the fields required by this kind
    pub fn validate(&self) -> Result<()> {
        fn require(field: &str, value: &str, kind: ActionKind) -> Result<()> {
            if value.trim().is_empty() {
                return Err(EthosError::InvalidAction(format!("{kind} action requires `{field}`")));
            }
            Ok(())
        }

        let kind = self.kind();
        match self {
            ActionPayload::Http { method, url, .. } => {
                if !HTTP_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
                    return Err(EthosError::InvalidAction(format!("unsupported HTTP method `{method}`")));
                }
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(EthosError::InvalidAction(format!("HTTP url must be absolute: `{url}`")));
                }
                Ok(())
            }
            ActionPayload::Process { program, .. } => require("program", program, kind),
            ActionPayload::Device { device_id, command, .. } => {
                require("device_id", device_id, kind)?;
                require("command", command, kind)
            }
            ActionPayload::File { op, path, contents } => {
                require("path", &path.to_string_lossy(), kind)?;
                if matches!(op, FileOp::Write | FileOp::Append) && contents.is_none() {
                    return Err(EthosError::InvalidAction("file write/append requires `contents`".into()));
                }
                Ok(())
            }
            ActionPayload::Powershell { script } => require("script", script, kind),
            ActionPayload::App { app, .. } => require("app", app, kind),
            ActionPayload::Web { url, .. } => require("url", url, kind),
            ActionPayload::Ui { target, .. } => require("target", target, kind),
            ActionPayload::System { command, .. } => require("command", command, kind),
            ActionPayload::Interact { prompt, .. } => require("prompt", prompt, kind),
            ActionPayload::Custom { kind: custom, .. } => require("kind", custom, kind),
        }
    }
}

/// A candidate action for one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Kind-specific payload
    #[serde(flatten)]
    pub payload: ActionPayload,
    /// Estimated risk in `[0, 1]`
    #[serde(default)]
    pub risk_level: f64,
    /// Free-form tags used by the value policy and alignment model
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ActionDefinition {
    /// Start building a definition around `payload`
    #[must_use]
    pub fn builder(payload: ActionPayload) -> ActionDefinitionBuilder {
        ActionDefinitionBuilder {
            name: None,
            payload,
            risk_level: 0.0,
            tags: BTreeSet::new(),
        }
    }

    /// Kind of the payload
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    /// Name of the action, falling back to its kind
    #[must_use]
    pub fn label(&self) -> String {
        match (&self.name, &self.payload) {
            (Some(name), _) => name.clone(),
            (None, ActionPayload::Custom { kind, .. }) => kind.clone(),
            (None, payload) => payload.kind().to_string(),
        }
    }

    /// Validate risk and payload, e.g. after deserialization
    pub fn validate(&self) -> Result<()> {
        if !self.risk_level.is_finite() || !(0.0..=1.0).contains(&self.risk_level) {
            return Err(EthosError::InvalidAction(format!(
                "risk_level must be within [0, 1], got {}",
                self.risk_level
            )));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(EthosError::InvalidAction("tags must not be blank".into()));
        }
        self.payload.validate()
    }

    /// Lower-cased tags
    pub fn tags_lowercase(&self) -> impl Iterator<Item = String> + '_ {
        self.tags.iter().map(|t| t.to_lowercase())
    }
}

/// Builder for [`ActionDefinition`]
#[derive(Debug, Clone)]
pub struct ActionDefinitionBuilder {
    name: Option<String>,
    payload: ActionPayload,
    risk_level: f64,
    tags: BTreeSet<String>,
}

impl ActionDefinitionBuilder {
    /// Set the action name
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the risk level
    #[must_use]
    pub fn risk(mut self, risk_level: f64) -> Self {
        self.risk_level = risk_level;
        self
    }

    /// Add one tag
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into().trim().to_string());
        self
    }

    /// Add several tags
    #[must_use]
    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        for tag in tags {
            self = self.tag(tag);
        }
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<ActionDefinition> {
        let definition = ActionDefinition {
            name: self.name,
            payload: self.payload,
            risk_level: self.risk_level,
            tags: self.tags,
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Outcome of one adapter execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the action succeeded
    pub ok: bool,
    /// Adapter-specific result value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error description when `ok` is false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Status code (HTTP status, exit code)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl ExecutionResult {
    /// Successful result carrying `value`
    #[must_use]
    pub fn success(value: serde_json::Value) -> Self {
        Self {
            ok: true,
            result: Some(value),
            error: None,
            status: None,
        }
    }

    /// Failed result with an error message
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
            status: None,
        }
    }

    /// Attach a status code
    #[must_use]
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }
}
