//! # Evalweave Core
//!
//! Settings resolution for the Evalweave evaluation hooks: the tracking
//! identity file reader, the four-source settings cascade and the loader that
//! produces [`CompositeSettings`], plus logging setup shared by hosts.

pub mod config;
pub mod environment;
pub mod error;
pub mod logging;

pub use config::{
    CompositeSettings, InitOverrides, ProjectIdentity, RunUploadSettings, SettingsGroup,
    SettingsLoader, TracingSettings,
};
pub use environment::Environment;
pub use error::{ConfigError, Result};
