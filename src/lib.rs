pub mod configuration;
pub mod data_capture;
pub mod error_handling;
pub mod flow_tracking;
pub mod geolocation;
pub mod monitor;

pub use configuration::config::{Args, Config};
pub use flow_tracking::connection_manager::ConnectionManager;
pub use monitor::orchestrator::Monitor;
