//! Core types shared by every layer: command registry, protocol versions,
//! device configuration, error taxonomy and listener traits.

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod traits;
pub mod version;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use logging::LogContext;
pub use traits::*;
pub use version::*;
