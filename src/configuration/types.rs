use clap::ValueEnum;
use serde::Deserialize;

/// Which capture variant feeds the aggregation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Packet capture replayed from a pcap savefile.
    PcapFile,
    /// Kernel UDP send/receive events read as JSON lines.
    TraceFeed,
}

/// What happens to a flow that exceeded the inactivity timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Delete the flow's statistics and view entry.
    #[default]
    Remove,
    /// Keep the history but flag the view entry hidden until the flow is active again.
    Hide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Log,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub backend: BackendKind,
    pub source: Option<String>,
    pub filter: String,
    pub monitored_port: u16,
    pub process_id: Option<u32>,
    pub promiscuous: bool,
    pub read_timeout_ms: u64,
    pub pace: bool,
    pub session_name: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::PcapFile,
            source: None,
            filter: String::from("udp dst port 3074"),
            monitored_port: 3074,
            process_id: None,
            promiscuous: true,
            read_timeout_ms: 1000,
            pace: false,
            session_name: String::from("UdpMonitorSession"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub min_bytes_threshold: u64,
    pub connection_timeout_secs: u64,
    pub merge_interval_ms: u64,
    pub refresh_interval_ms: u64,
    pub channel_capacity: usize,
    pub eviction: EvictionPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            min_bytes_threshold: 1024,
            connection_timeout_secs: 3,
            merge_interval_ms: 1000,
            refresh_interval_ms: 3000,
            channel_capacity: 4096,
            eviction: EvictionPolicy::Remove,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct GeolocationSettings {
    pub database: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub name: Option<String>,
    pub poll_interval_secs: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            name: None,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub format: OutputFormat,
}
