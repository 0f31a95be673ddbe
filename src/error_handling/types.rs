use std::fmt;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    InvalidValue(String),
    NotInRange(String),
    MissingSource,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::InvalidValue(e) => write!(f, "Invalid value: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::MissingSource => write!(f, "No capture source configured"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures of a capture backend or of a capture source built on top of one.
///
/// `DeviceError` means the device or trace session could not be used and the caller may retry
/// with another one. `PermissionError` is raised before any capture attempt and is fatal to the
/// current session.
#[derive(Debug)]
pub enum CaptureError {
    DeviceError(String),
    PermissionError(String),
    InvalidFilter(String),
    IoError(std::io::Error),
    NotOpen,
    AlreadyRunning,
}

impl CaptureError {
    /// Whether selecting another device and starting again can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CaptureError::PermissionError(_))
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::DeviceError(e) => write!(f, "Capture device error: {}", e),
            CaptureError::PermissionError(e) => write!(f, "Insufficient privileges: {}", e),
            CaptureError::InvalidFilter(e) => write!(f, "Invalid capture filter: {}", e),
            CaptureError::IoError(e) => write!(f, "Capture IO error: {}", e),
            CaptureError::NotOpen => write!(f, "Capture device is not open"),
            CaptureError::AlreadyRunning => write!(f, "Capture is already running"),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => CaptureError::PermissionError(err.to_string()),
            std::io::ErrorKind::NotFound => CaptureError::DeviceError(err.to_string()),
            _ => CaptureError::IoError(err),
        }
    }
}

/// Reasons a captured frame could not be decoded. Never leaves the capture thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    Truncated,
    UnsupportedLinkType(u32),
    NotIp,
    BadHeader(&'static str),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Truncated => write!(f, "Truncated frame"),
            PacketError::UnsupportedLinkType(t) => write!(f, "Unsupported link type {}", t),
            PacketError::NotIp => write!(f, "Not an IP packet"),
            PacketError::BadHeader(e) => write!(f, "Bad header: {}", e),
        }
    }
}

impl std::error::Error for PacketError {}

#[derive(Debug)]
pub enum MonitorError {
    NoCaptureSource,
    AlreadyRunning,
    CaptureError(CaptureError),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::NoCaptureSource => write!(f, "No capture source selected"),
            MonitorError::AlreadyRunning => write!(f, "Monitoring is already running"),
            MonitorError::CaptureError(e) => write!(f, "Capture error: {}", e),
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<CaptureError> for MonitorError {
    fn from(err: CaptureError) -> Self {
        MonitorError::CaptureError(err)
    }
}
