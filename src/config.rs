//! Process arguments and handler configuration.
//!
//! The controller spawns one worker per deployed handler and passes
//! everything positionally; `clap` exits with code 2 when a required
//! argument is missing. Handler-level configuration arrives later in the
//! `Init` payload and is split into [`HandlerConfig`] (what the handler
//! does) and [`ServerSettings`] (where the platform lives).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::proto::InitPayload;

/// Number of key-space shards the platform addresses.
pub const NUM_VBUCKETS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IpcType {
    #[value(name = "af_unix")]
    AfUnix,
    #[value(name = "af_inet")]
    AfInet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IpMode {
    #[value(name = "ipv4")]
    Ipv4,
    #[value(name = "ipv6")]
    Ipv6,
}

/// Positional arguments, in the order the controller passes them.
#[derive(Debug, Clone, Parser)]
#[command(name = "evhost")]
pub struct WorkerArgs {
    pub appname: String,
    pub ipc_type: IpcType,
    /// TCP port or Unix socket path of the main channel.
    pub port_or_uds: String,
    /// TCP port or Unix socket path of the feedback channel.
    pub feedback_port_or_uds: String,
    pub worker_id: String,
    pub batch_size: usize,
    pub feedback_batch_size: usize,
    pub diag_dir: PathBuf,
    pub ip_mode: IpMode,
    /// "true" enables the crash handler (set up by the embedder).
    pub breakpad_on: String,
    pub function_id: String,
    pub user_prefix: Option<String>,
}

impl WorkerArgs {
    pub fn loopback_host(&self) -> &'static str {
        match self.ip_mode {
            IpMode::Ipv4 => "127.0.0.1",
            IpMode::Ipv6 => "::1",
        }
    }

    /// Key prefix under which this handler's timer documents live.
    pub fn timer_prefix(&self) -> String {
        match &self.user_prefix {
            Some(prefix) => format!("{}::{}", prefix, self.function_id),
            None => format!("evt::{}", self.function_id),
        }
    }
}

/// Handler-scoped configuration from the `Init` payload.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub app_name: String,
    pub dep_cfg: String,
    pub execution_timeout: Duration,
    pub lcb_inst_capacity: u32,
    pub using_timer: bool,
    pub timer_context_size: usize,
    pub handler_headers: Vec<String>,
    pub handler_footers: Vec<String>,
}

/// Platform-scoped settings from the `Init` payload.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub checkpoint_interval: Duration,
    pub debugger_port: String,
    pub eventing_dir: String,
    pub eventing_port: String,
    pub host_addr: String,
    pub kv_host_port: String,
    pub function_instance_id: String,
}

impl HandlerConfig {
    pub fn from_init(init: &InitPayload) -> Self {
        Self {
            app_name: init.app_name.clone(),
            dep_cfg: init.depcfg.clone(),
            execution_timeout: Duration::from_secs(init.execution_timeout),
            lcb_inst_capacity: init.lcb_inst_capacity,
            using_timer: init.using_timer,
            timer_context_size: init.timer_context_size as usize,
            handler_headers: init.handler_headers.clone(),
            handler_footers: init.handler_footers.clone(),
        }
    }
}

impl ServerSettings {
    pub fn from_init(init: &InitPayload) -> Self {
        Self {
            checkpoint_interval: Duration::from_millis(init.checkpoint_interval),
            debugger_port: init.debugger_port.clone(),
            eventing_dir: init.eventing_dir.clone(),
            eventing_port: init.curr_eventing_port.clone(),
            host_addr: init.curr_host.clone(),
            kv_host_port: init.kv_host_port.clone(),
            function_instance_id: init.function_instance_id.clone(),
        }
    }
}

/// Deployment descriptor carried in `depcfg` (JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub source_bucket: String,
    pub metadata_bucket: String,
    pub buckets: Vec<BucketBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketBinding {
    pub alias: String,
    pub bucket_name: String,
}

impl DeploymentConfig {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Hard bounds that keep a misbehaving peer from exhausting memory.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_queue_items: usize,
    pub max_queue_bytes: usize,
    pub max_cbor_text_len: usize,
    pub max_cbor_entries: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 64 * 1024 * 1024,
            max_queue_items: 10_000,
            max_queue_bytes: 64 * 1024 * 1024,
            max_cbor_text_len: 32 * 1024 * 1024,
            max_cbor_entries: 65_536,
        }
    }
}
