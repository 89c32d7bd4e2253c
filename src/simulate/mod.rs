//! An in-memory lab
//!
//! [`SimulatedCloud`] and [`SimulatedTransport`] stand in for the cloud API
//! and the SSH transport. They back the test suite and `--simulate` runs.

pub mod cloud;
pub mod transport;

pub use cloud::{Origin, SimulatedCloud, PUBLIC_CIDR, PUBLIC_NETWORK_ID, PUBLIC_SUBNET_ID};
pub use transport::{
    parse_command, GuestCommand, SimulatedLocalShell, SimulatedSession, SimulatedTransport,
};

use crate::settings::Settings;

/// Settings pointing at the simulated public network
pub fn lab_settings(mut settings: Settings) -> Settings {
    settings.cloud.public_network_id = PUBLIC_NETWORK_ID.to_string();
    settings.cloud.public_router_id = None;
    settings.cloud.image_ref = "cirros".to_string();
    settings
}
