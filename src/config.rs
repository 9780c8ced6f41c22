//! Configuration for the telemetry bridge
//!
//! Options are read from the environment under their stable names, with
//! `_GW_PNFP` / `_GW_LOGP` overriding the published-nodes and log file
//! paths. Validation failures are fatal at startup.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{BridgeError, BridgeResult};
use crate::hub::HUB_MESSAGE_SIZE_MAX;
use crate::model::SuppressedStatusCodes;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    fn parse(text: &str) -> BridgeResult<Self> {
        match text.to_ascii_lowercase().as_str() {
            "fatal" => Ok(Self::Fatal),
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "verbose" => Ok(Self::Verbose),
            other => Err(BridgeError::Configuration(format!(
                "unknown LogLevel '{other}'"
            ))),
        }
    }

    /// Directive for the tracing EnvFilter. The five-level sink has no
    /// fatal; it maps onto error.
    pub fn filter_directive(&self) -> &'static str {
        match self {
            Self::Fatal | Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "trace",
        }
    }
}

/// The environment variables that enable edge-module mode when all are set.
const EDGE_MODULE_VARS: &[&str] = &[
    "IOTEDGE_IOTHUBHOSTNAME",
    "IOTEDGE_MODULEGENERATIONID",
    "IOTEDGE_WORKLOADURI",
    "IOTEDGE_DEVICEID",
    "IOTEDGE_MODULEID",
];

#[derive(Clone, Debug)]
pub struct Settings {
    pub node_config_file: PathBuf,
    pub telemetry_config_file: Option<PathBuf>,
    pub site: Option<String>,
    pub session_connect_wait: Duration,
    pub queue_capacity: usize,
    /// -1 disables diagnostics, 0 keeps counters silent, >0 output period
    pub diagnostics_interval: i64,
    pub log_file: Option<PathBuf>,
    pub log_flush_interval: Duration,
    pub log_level: LogLevel,
    pub hub_message_size: usize,
    pub send_interval: Duration,
    pub shutdown_wait: Duration,
    pub device_connection_string: Option<String>,
    pub heartbeat_interval_default: u32,
    pub skip_first_default: bool,
    pub default_sampling_interval_ms: i32,
    pub default_publishing_interval_ms: i32,
    pub auto_accept_certs: bool,
    pub fetch_display_names: bool,
    pub suppressed_status_codes: SuppressedStatusCodes,
    pub keep_alive_disconnect_threshold: u32,
    pub operation_timeout: Duration,
    pub application_key_file: Option<PathBuf>,
    pub hub_broker_url: Option<String>,
    pub hub_topic: String,
    pub edge_mode: bool,
}

impl Settings {
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build settings from an arbitrary lookup; `from_env` wires this to the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BridgeResult<Self> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let node_config_file = get("_GW_PNFP")
            .or_else(|| get("PublisherNodeConfigurationFilename"))
            .unwrap_or_else(|| "publishednodes.json".to_string());

        let site = get("PublisherSite");
        if let Some(site) = &site {
            if !valid_hostname(site) {
                return Err(BridgeError::Configuration(format!(
                    "PublisherSite '{site}' is not a valid DNS hostname"
                )));
            }
        }

        let session_connect_wait_secs: u64 = parse(&get, "SessionConnectWaitSec", 15)?;
        if session_connect_wait_secs <= 10 {
            return Err(BridgeError::Configuration(
                "SessionConnectWaitSec must be greater than 10".to_string(),
            ));
        }

        let queue_capacity: usize = parse(&get, "MonitoredItemsQueueCapacity", 8192)?;
        if queue_capacity < 1024 {
            return Err(BridgeError::Configuration(
                "MonitoredItemsQueueCapacity must be at least 1024".to_string(),
            ));
        }

        let diagnostics_interval: i64 = parse(&get, "DiagnosticsInterval", 0)?;
        if diagnostics_interval < -1 {
            return Err(BridgeError::Configuration(
                "DiagnosticsInterval must be -1, 0 or a positive period".to_string(),
            ));
        }

        let log_flush_secs: u64 = parse(&get, "LogFileFlushTimeSpanSec", 30)?;
        if log_flush_secs == 0 {
            return Err(BridgeError::Configuration(
                "LogFileFlushTimeSpanSec must be greater than 0".to_string(),
            ));
        }

        let log_level = match get("LogLevel") {
            Some(text) => LogLevel::parse(&text)?,
            None => LogLevel::Info,
        };

        let hub_message_size: usize = parse(&get, "HubMessageSize", HUB_MESSAGE_SIZE_MAX)?;
        if hub_message_size > HUB_MESSAGE_SIZE_MAX {
            return Err(BridgeError::Configuration(format!(
                "HubMessageSize must be between 0 and {HUB_MESSAGE_SIZE_MAX}"
            )));
        }

        let send_interval_secs: u64 = parse(&get, "DefaultSendIntervalSeconds", 10)?;
        let shutdown_wait_secs: u64 = parse(&get, "PublisherShutdownWaitPeriod", 10)?;

        let heartbeat_interval_default: u32 = parse(&get, "HeartbeatIntervalDefault", 0)?;
        if heartbeat_interval_default > 86_400 {
            return Err(BridgeError::Configuration(
                "HeartbeatIntervalDefault must be between 0 and 86400".to_string(),
            ));
        }

        let default_sampling_interval_ms: i32 = parse(&get, "DefaultOpcSamplingInterval", 1000)?;
        let default_publishing_interval_ms: i32 =
            parse(&get, "DefaultOpcPublishingInterval", 0)?;
        if default_publishing_interval_ms > 0
            && default_publishing_interval_ms < default_sampling_interval_ms
        {
            return Err(BridgeError::Configuration(
                "DefaultOpcPublishingInterval must be at least DefaultOpcSamplingInterval"
                    .to_string(),
            ));
        }

        let suppressed_status_codes = match get("SuppressedOpcStatusCodes") {
            Some(text) => SuppressedStatusCodes::parse(&text)?,
            None => SuppressedStatusCodes::default(),
        };

        let keep_alive_disconnect_threshold: u32 =
            parse(&get, "OpcKeepAliveDisconnectThreshold", 5)?;
        let operation_timeout_secs: u64 = parse(&get, "OpcOperationTimeout", 120)?;

        let edge_mode = EDGE_MODULE_VARS.iter().all(|name| get(name).is_some());
        let device_connection_string = get("DeviceConnectionString");
        if edge_mode && device_connection_string.is_some() {
            return Err(BridgeError::Configuration(
                "DeviceConnectionString must not be set in edge-module mode".to_string(),
            ));
        }

        Ok(Self {
            node_config_file: PathBuf::from(node_config_file),
            telemetry_config_file: get("TelemetryConfigurationFilename").map(PathBuf::from),
            site,
            session_connect_wait: Duration::from_secs(session_connect_wait_secs),
            queue_capacity,
            diagnostics_interval,
            log_file: get("_GW_LOGP").or_else(|| get("LogFileName")).map(PathBuf::from),
            log_flush_interval: Duration::from_secs(log_flush_secs),
            log_level,
            hub_message_size,
            send_interval: Duration::from_secs(send_interval_secs),
            shutdown_wait: Duration::from_secs(shutdown_wait_secs),
            device_connection_string,
            heartbeat_interval_default,
            skip_first_default: parse_bool(&get, "SkipFirstDefault", false)?,
            default_sampling_interval_ms,
            default_publishing_interval_ms,
            auto_accept_certs: parse_bool(&get, "AutoAcceptCerts", false)?,
            fetch_display_names: parse_bool(&get, "FetchOpcNodeDisplayName", false)?,
            suppressed_status_codes,
            keep_alive_disconnect_threshold,
            operation_timeout: Duration::from_secs(operation_timeout_secs),
            application_key_file: get("ApplicationKeyFilename").map(PathBuf::from),
            hub_broker_url: get("HubTransportBrokerUrl"),
            hub_topic: get("HubTransportTopic")
                .unwrap_or_else(|| "devices/telemetry".to_string()),
            edge_mode,
        })
    }
}

fn parse<T, G>(get: &G, name: &str, default: T) -> BridgeResult<T>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(text) => text.parse::<T>().map_err(|_| {
            BridgeError::Configuration(format!("invalid value '{text}' for {name}"))
        }),
    }
}

fn parse_bool<G>(get: &G, name: &str, default: bool) -> BridgeResult<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(text) => match text.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(BridgeError::Configuration(format!(
                "invalid value '{other}' for {name}"
            ))),
        },
    }
}

/// RFC 1123 host name: dot-separated labels of letters, digits and hyphens,
/// no label edge hyphens, 255 chars total.
fn valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}
