use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments.
///
/// Every option except `--config` overrides the matching value of the configuration file, so a
/// one-off run can be launched without writing a file at all:
///
/// ```text
/// flowwatch --backend pcap-file --source capture.pcap --threshold 2048
/// ```
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "flowwatch")]
#[command(version)]
#[command(about = "Live per-peer UDP traffic view for a monitored process")]
pub struct Args {
    /// Path of the TOML configuration file
    ///
    /// # Command Line
    /// Use `--config <FILE>` or the `FLOWWATCH_CONFIG` environment variable
    #[arg(long, short, env = "FLOWWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Capture variant feeding the engine
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Capture device or trace feed path (`-` reads the trace feed from stdin)
    #[arg(long)]
    pub source: Option<String>,

    /// Capture filter expression installed on the packet device
    #[arg(long)]
    pub filter: Option<String>,

    /// Local UDP port of the monitored process
    #[arg(long)]
    pub port: Option<u16>,

    /// Name of the process whose presence starts and stops monitoring
    #[arg(long)]
    pub process_name: Option<String>,

    /// Minimum total bytes before a peer is shown
    #[arg(long)]
    pub threshold: Option<u64>,

    /// Eviction policy for inactive peers
    #[arg(long, value_enum)]
    pub eviction: Option<EvictionPolicy>,

    /// Emit snapshots as JSON lines on stdout
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

/// Complete runtime configuration, as read from the TOML file.
///
/// All sections and fields are optional; missing values take the defaults of the matching
/// settings type. Only `capture.source` has no usable default and is checked by
/// [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureSettings,
    pub engine: EngineSettings,
    pub geolocation: GeolocationSettings,
    pub process: ProcessSettings,
    pub output: OutputSettings,
}

impl Config {
    /// Reads and parses a configuration file without validating it.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Config, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    /// Builds the effective configuration: file (if any), then command-line overrides, then
    /// validation.
    pub fn load(args: &Args) -> Result<Config, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(backend) = args.backend {
            self.capture.backend = backend;
        }
        if let Some(source) = &args.source {
            self.capture.source = Some(source.clone());
        }
        if let Some(filter) = &args.filter {
            self.capture.filter = filter.clone();
        }
        if let Some(port) = args.port {
            self.capture.monitored_port = port;
        }
        if let Some(name) = &args.process_name {
            self.process.name = Some(name.clone());
        }
        if let Some(threshold) = args.threshold {
            self.engine.min_bytes_threshold = threshold;
        }
        if let Some(eviction) = args.eviction {
            self.engine.eviction = eviction;
        }
        if args.json {
            self.output.format = OutputFormat::Json;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.capture.source {
            None => return Err(ConfigError::MissingSource),
            Some(s) if s.trim().is_empty() => return Err(ConfigError::MissingSource),
            Some(_) => {}
        }
        if self.capture.backend == BackendKind::PcapFile && self.capture.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "capture.filter must not be empty for the packet capture backend".to_string(),
            ));
        }
        if self.engine.merge_interval_ms == 0 {
            return Err(ConfigError::NotInRange(
                "engine.merge_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.engine.refresh_interval_ms < self.engine.merge_interval_ms {
            return Err(ConfigError::NotInRange(format!(
                "engine.refresh_interval_ms ({}) must not be shorter than engine.merge_interval_ms ({})",
                self.engine.refresh_interval_ms, self.engine.merge_interval_ms
            )));
        }
        if self.engine.channel_capacity == 0 {
            return Err(ConfigError::NotInRange(
                "engine.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.process.name.is_some() && self.process.poll_interval_secs == 0 {
            return Err(ConfigError::NotInRange(
                "process.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn merge_interval(&self) -> Duration {
        Duration::from_millis(self.engine.merge_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.engine.refresh_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.connection_timeout_secs)
    }

    pub fn process_poll_interval(&self) -> Duration {
        Duration::from_secs(self.process.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sim_config_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[capture]
backend = "trace-feed"
source = "/tmp/events.jsonl"
monitored_port = 3075
process_id = 4242

[engine]
min_bytes_threshold = 2048
eviction = "hide"

[process]
name = "cod"

[output]
format = "json"
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.capture.backend, BackendKind::PcapFile);
        assert_eq!(config.capture.filter, "udp dst port 3074");
        assert_eq!(config.capture.monitored_port, 3074);
        assert_eq!(config.engine.min_bytes_threshold, 1024);
        assert_eq!(config.connection_timeout(), Duration::from_secs(3));
        assert_eq!(config.merge_interval(), Duration::from_secs(1));
        assert_eq!(config.refresh_interval(), Duration::from_secs(3));
        assert_eq!(config.engine.eviction, EvictionPolicy::Remove);
        assert_eq!(config.output.format, OutputFormat::Log);
        assert!(matches!(config.validate(), Err(ConfigError::MissingSource)));
    }

    #[test]
    fn test_from_file_partial_sections() {
        let file = sim_config_file();
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.capture.backend, BackendKind::TraceFeed);
        assert_eq!(config.capture.source.as_deref(), Some("/tmp/events.jsonl"));
        assert_eq!(config.capture.monitored_port, 3075);
        assert_eq!(config.capture.process_id, Some(4242));
        assert_eq!(config.engine.min_bytes_threshold, 2048);
        assert_eq!(config.engine.eviction, EvictionPolicy::Hide);
        // untouched fields keep their defaults
        assert_eq!(config.engine.refresh_interval_ms, 3000);
        assert_eq!(config.process.name.as_deref(), Some("cod"));
        assert_eq!(config.output.format, OutputFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let err = Config::from_toml_str("[engine]\nmin_bytes_threshold = \"lots\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));

        let err = Config::from_toml_str("[capture]\nbackend = \"raw-socket\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn test_validate_rejects_bad_intervals() {
        let mut config = Config::default();
        config.capture.source = Some("capture.pcap".to_string());
        assert!(config.validate().is_ok());

        config.engine.refresh_interval_ms = 500;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        config.engine.refresh_interval_ms = 3000;
        config.engine.channel_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));

        config.engine.channel_capacity = 16;
        config.engine.merge_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NotInRange(_))));
    }

    #[test]
    #[serial]
    fn test_args_override_file() {
        std::env::remove_var("FLOWWATCH_CONFIG");
        let file = sim_config_file();
        let path = file.path().to_str().unwrap().to_string();
        let args = Args::try_parse_from([
            "flowwatch",
            "--config",
            path.as_str(),
            "--backend",
            "pcap-file",
            "--source",
            "capture.pcap",
            "--threshold",
            "10",
            "--eviction",
            "remove",
        ])
        .unwrap_or_else(|e| panic!("{}", e));

        let config = Config::load(&args).unwrap();
        assert_eq!(config.capture.backend, BackendKind::PcapFile);
        assert_eq!(config.capture.source.as_deref(), Some("capture.pcap"));
        assert_eq!(config.engine.min_bytes_threshold, 10);
        assert_eq!(config.engine.eviction, EvictionPolicy::Remove);
        // from the file
        assert_eq!(config.capture.monitored_port, 3075);
    }

    #[test]
    #[serial]
    fn test_config_path_from_environment() {
        let file = sim_config_file();
        std::env::set_var("FLOWWATCH_CONFIG", file.path());

        let args = Args::try_parse_from(["flowwatch"]).unwrap();
        std::env::remove_var("FLOWWATCH_CONFIG");

        assert_eq!(args.config.as_deref(), Some(file.path()));
        let config = Config::load(&args).unwrap();
        assert_eq!(config.capture.backend, BackendKind::TraceFeed);
    }
}
