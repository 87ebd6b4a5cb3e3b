//! provmon-core: configuration and shared primitives for the monitor.
//!
//! - **`config`**: `provmon.toml` model with defaults for every section
//! - **`duration`**: human duration strings (`500ms`, `5s`, `2m`)
//! - **`version`**: peer protocol version parsing and compatibility

pub mod config;
pub mod duration;
pub mod version;

pub use config::{
    ConfigError, MonitorConfig, MonitorSection, PeersSection, ProbeKind, ProbeSection,
    ProvisionSection, SelectorSection, StrategyKind,
};
pub use duration::parse_duration;
pub use version::{PROTOCOL_VERSION, ProtocolVersion, VersionError};
