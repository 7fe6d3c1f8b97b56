//! Tuya local protocol - device API
//!
//! High-level calls over one [`TuyaDevice`] connection.

mod device;

pub use device::*;
