pub mod config;
pub mod control;
pub mod cron;
pub mod dispatch;
pub mod envelope;
pub mod format;
pub mod lifecycle;
pub mod meter;
pub mod ports;
pub mod replay;
pub mod safety;
pub mod telemetry;
pub mod timers;
pub mod topics;

#[cfg(test)]
mod testing;

pub use config::{ControlPlaneConfig, DeviceConfig, NetworkConfig, ProvisioningUpdate};
pub use control::{ControlError, ControlPlane, ControlPlaneContext, Peripherals};
pub use envelope::{EnvelopeCodec, EnvelopeError};
pub use meter::{MeterDialect, MeterEvent, MeterReading, MeterSource};
pub use topics::*;
