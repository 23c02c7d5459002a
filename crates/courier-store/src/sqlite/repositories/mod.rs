//! Stateless repositories; every method takes `&Connection`.

pub mod device_token;
pub mod presence;

pub use device_token::{DeviceTokenRepo, DeviceTokenRow, RegisterTokenResult};
pub use presence::{PresenceRepo, PresenceRow};
