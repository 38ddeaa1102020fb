//! Option storage consumed by the supervisor while launching a session.
//!
//! Persistence itself lives elsewhere; the supervisor only needs a read view
//! through [`Store`]. [`StaticStore`] keeps the options in memory.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Server-wide options relevant to process supervision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerOptions {
    /// `host:port` the server's UDP plugin protocol sends to
    pub udp_plugin_address: String,
    /// Local port the server expects plugin replies on
    pub udp_plugin_local_port: u16,
    pub enable_content_manager_wrapper: bool,
    pub content_manager_wrapper_port: u16,
}

/// sTracker options. The UDP ports are filled in by the supervisor before the
/// configuration is written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StrackerOptions {
    pub enable_stracker: bool,
    /// Port sTracker sends plugin commands to (the server's local plugin port)
    pub send_port: u16,
    /// Port sTracker receives server events on
    pub receive_port: u16,
    /// pTracker listening port, informational only
    pub listening_port: u16,
}

pub trait Store: Send + Sync {
    fn load_server_options(&self) -> anyhow::Result<ServerOptions>;
    fn load_stracker_options(&self) -> anyhow::Result<StrackerOptions>;
}

/// In-memory store. Options can be replaced at runtime and are picked up by
/// the next launch.
#[derive(Debug, Default)]
pub struct StaticStore {
    server: RwLock<ServerOptions>,
    stracker: RwLock<Option<StrackerOptions>>,
}

impl StaticStore {
    pub fn new(server: ServerOptions, stracker: Option<StrackerOptions>) -> Self {
        Self {
            server: RwLock::new(server),
            stracker: RwLock::new(stracker),
        }
    }

    pub fn set_server_options(&self, options: ServerOptions) {
        *self.server.write().unwrap_or_else(|e| e.into_inner()) = options;
    }

    pub fn set_stracker_options(&self, options: Option<StrackerOptions>) {
        *self.stracker.write().unwrap_or_else(|e| e.into_inner()) = options;
    }
}

impl Store for StaticStore {
    fn load_server_options(&self) -> anyhow::Result<ServerOptions> {
        Ok(self.server.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn load_stracker_options(&self) -> anyhow::Result<StrackerOptions> {
        self.stracker
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| anyhow::anyhow!("sTracker options not configured"))
    }
}
