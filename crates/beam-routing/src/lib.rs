//! Beam Routing
//!
//! Spot-beam provisioning and handover route convergence for the
//! satellite access network:
//!
//! - Channel pairs and gateway nodes per beam ([`BeamChannelProvisioner`])
//! - Beam address blocks, permanent ARP state and static routes
//!   ([`BeamRouteProvisioner`])
//! - UT / GW user LANs and the shared terrestrial router
//!   ([`UserNetworkProvisioner`])
//! - Route and ARP migration on handover ([`HandoverRouteConvergence`])
//! - Time-ordered handover replay ([`HandoverQueue`])
//! - JSON scenario configuration and builder ([`ScenarioBuilder`])

use isl_routing::IslError;
use sat_netstack::{DeviceId, NetStackError, NodeId};
use thiserror::Error;

pub mod channels;
pub mod handover;
pub mod provision;
pub mod queue;
pub mod scenario;
pub mod users;

pub use channels::{Beam, BeamChannelProvisioner, BeamDelays};
pub use handover::{
    ConvergenceError, ConvergencePlan, HandoverKind, HandoverRouteConvergence, Mutation,
};
pub use provision::{BeamProvisioning, BeamRouteProvisioner};
pub use queue::{HandoverEvent, HandoverQueue, HandoverRecord};
pub use scenario::{
    duration_from_secs, BeamConfig, HandoverConfig, PoolsConfig, Scenario, ScenarioBuilder, ScenarioConfig,
    ScenarioSnapshot, TerminalInfo,
};
pub use users::{
    mirror_gateway_routes, set_routes_for_gws, GatewayBackbone, UserNetworkProvisioner,
};

/// Beam provisioning / scenario errors
#[derive(Error, Debug)]
pub enum BeamError {
    #[error("Beam {0} already installed")]
    DuplicateBeam(u32),
    #[error("Gateway {gw_id} already uses feeder frequency {feeder_freq_id}")]
    DuplicateGatewayLink { gw_id: u32, feeder_freq_id: u32 },
    #[error("{terminals} terminals but {devices} terminal devices")]
    ContainerMismatch { terminals: usize, devices: usize },
    #[error("Device {device} does not belong to {node}")]
    ForeignDevice { device: DeviceId, node: NodeId },
    #[error("Unknown beam: {0}")]
    UnknownBeam(u32),
    #[error("Unknown terminal index: {0}")]
    UnknownTerminal(usize),
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),
    #[error("Network stack error: {0}")]
    NetStack(#[from] NetStackError),
    #[error("Convergence error: {0}")]
    Convergence(#[from] ConvergenceError),
    #[error("ISL error: {0}")]
    Isl(#[from] IslError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BeamError>;
