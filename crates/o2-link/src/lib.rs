//! Console and relay plumbing for o2.
//!
//! [`device::DeviceQueue`] serializes memory access to a console behind the
//! [`device::Device`] trait, [`drivers::DriverRegistry`] names the available
//! device backends, and [`relay::RelayClient`] speaks the group relay's UDP
//! protocol. Nothing here knows what the bytes mean.

pub mod device;
pub mod drivers;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod relay;

pub use device::{Device, DeviceQueue, Request, Response};
pub use drivers::DriverRegistry;
pub use error::{DeviceError, ProtocolError, RelayError};
pub use mock::{MockDevice, MockHandle};
pub use relay::{RelayClient, RelayEvent, RelaySettings};
