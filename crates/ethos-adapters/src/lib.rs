//! Built-in action adapters for Ethos
//!
//! Each adapter handles one action kind and never panics on bad input:
//! failures come back as `ok: false` results. Network-backed adapters build
//! their client on first use.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod app;
pub mod device;
pub mod filesystem;
pub mod http;
pub mod process;
pub mod script;

use std::sync::Arc;
use std::time::Duration;

use ethos_core::{AdaptersConfig, AdapterRegistry};

pub use app::AppAdapter;
pub use device::DeviceAdapter;
pub use filesystem::FileAdapter;
pub use http::HttpAdapter;
pub use process::ProcessAdapter;
pub use script::{ScriptAdapter, Shell};

/// Register every built-in adapter as a fallback, so adapters the host
/// registers later take priority. The device adapter is only added when a
/// hub URL is configured.
pub fn register_builtin_adapters(registry: &AdapterRegistry, config: &AdaptersConfig) {
    let http_timeout = Duration::from_millis(config.http_timeout_ms);
    let process_timeout = Duration::from_millis(config.process_timeout_ms);

    registry.register_fallback(Arc::new(HttpAdapter::new(http_timeout)));
    registry.register_fallback(Arc::new(match &config.file_root {
        Some(root) => FileAdapter::confined(root),
        None => FileAdapter::new(),
    }));
    registry.register_fallback(Arc::new(ProcessAdapter::new(process_timeout)));
    let shell = if config.powershell { Shell::PowerShell } else { Shell::Posix };
    registry.register_fallback(Arc::new(ScriptAdapter::new(shell, process_timeout)));
    registry.register_fallback(Arc::new(AppAdapter::new()));
    if let Some(url) = &config.device_hub_url {
        registry.register_fallback(Arc::new(DeviceAdapter::new(url.clone(), http_timeout)));
    }
    tracing::debug!(adapters = ?registry.names(), "registered built-in adapters");
}
