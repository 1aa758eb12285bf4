//! Scenario configuration and builder
//!
//! A scenario is loaded from JSON and wired in a fixed order: terminal
//! nodes, terminal users, beams, gateway users, gateway defaults, router
//! mirroring, then the satellites and their ISLs. Every MAC is registered
//! in the role directory before it is frozen and shared with the
//! handover and ISL code.

use crate::channels::BeamChannelProvisioner;
use crate::handover::HandoverRouteConvergence;
use crate::provision::{BeamProvisioning, BeamRouteProvisioner};
use crate::queue::{HandoverEvent, HandoverQueue, HandoverRecord};
use crate::users::{
    mirror_gateway_routes, set_routes_for_gws, GatewayBackbone, UserNetworkProvisioner,
};
use crate::{BeamDelays, BeamError, Result};
use isl_routing::{IslArbiter, IslError, IslPacket, IslTopology, IslUnicastArbiter};
use sat_netstack::{
    AddressPoolConfig, ConstantPropagationDelay, DeviceId, DeviceKind, IdDirectory, Mac48Address,
    Network, NodeId, NodeKind, NodeSnapshot, SharedDirectory, DEFAULT_PROPAGATION_DELAY_S,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Address spaces for beams, terminal LANs and the gateway side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub beam: AddressPoolConfig,
    pub ut: AddressPoolConfig,
    pub gw: AddressPoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            beam: AddressPoolConfig::beam_default(),
            ut: AddressPoolConfig::ut_default(),
            gw: AddressPoolConfig::gw_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeamConfig {
    pub beam_id: u32,
    pub gw_id: u32,
    pub user_freq_id: u32,
    pub feeder_freq_id: u32,
    /// Number of terminals starting in this beam
    #[serde(default)]
    pub terminals: usize,
}

impl BeamConfig {
    pub fn new(
        beam_id: u32,
        gw_id: u32,
        user_freq_id: u32,
        feeder_freq_id: u32,
        terminals: usize,
    ) -> Self {
        Self {
            beam_id,
            gw_id,
            user_freq_id,
            feeder_freq_id,
            terminals,
        }
    }
}

/// Move `terminal` (index in creation order) to `beam_id` at `at_s`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandoverConfig {
    pub at_s: f64,
    pub terminal: usize,
    pub beam_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub pools: PoolsConfig,
    pub propagation_delay_s: f64,
    pub beams: Vec<BeamConfig>,
    pub ut_users_per_terminal: usize,
    pub gw_users: usize,
    /// Satellite 0 carries the beams
    pub satellites: usize,
    pub isls: Vec<(u32, u32)>,
    pub handovers: Vec<HandoverConfig>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            pools: PoolsConfig::default(),
            propagation_delay_s: DEFAULT_PROPAGATION_DELAY_S,
            beams: vec![BeamConfig::new(1, 1, 1, 1, 1)],
            ut_users_per_terminal: 1,
            gw_users: 1,
            satellites: 1,
            isls: Vec::new(),
            handovers: Vec::new(),
        }
    }
}

impl ScenarioConfig {
    /// Load scenario from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading scenario from {:?}", path);

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: ScenarioConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_beams(mut self, beams: Vec<BeamConfig>) -> Self {
        self.beams = beams;
        self
    }

    pub fn with_users(mut self, ut_users_per_terminal: usize, gw_users: usize) -> Self {
        self.ut_users_per_terminal = ut_users_per_terminal;
        self.gw_users = gw_users;
        self
    }

    pub fn with_satellites(mut self, satellites: usize, isls: Vec<(u32, u32)>) -> Self {
        self.satellites = satellites;
        self.isls = isls;
        self
    }

    pub fn with_handover(mut self, at_s: f64, terminal: usize, beam_id: u32) -> Self {
        self.handovers.push(HandoverConfig {
            at_s,
            terminal,
            beam_id,
        });
        self
    }

    pub fn with_pools(mut self, pools: PoolsConfig) -> Self {
        self.pools = pools;
        self
    }

    /// Time of the latest configured handover, 0 when there is none
    pub fn last_handover_s(&self) -> f64 {
        self.handovers.iter().map(|h| h.at_s).fold(0.0, f64::max)
    }

    pub fn terminal_count(&self) -> usize {
        self.beams.iter().map(|b| b.terminals).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.beams.is_empty() {
            return Err(BeamError::InvalidScenario("no beams configured".to_string()));
        }
        if self.satellites == 0 {
            return Err(BeamError::InvalidScenario(
                "at least one satellite is required".to_string(),
            ));
        }
        duration_from_secs(self.propagation_delay_s, "propagation delay")?;
        for handover in &self.handovers {
            duration_from_secs(handover.at_s, "handover time")?;
        }
        Ok(())
    }
}

/// Non-negative seconds that fit a [`Duration`]
pub fn duration_from_secs(value: f64, what: &str) -> Result<Duration> {
    if value < 0.0 {
        return Err(BeamError::InvalidScenario(format!("invalid {} {}", what, value)));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| BeamError::InvalidScenario(format!("invalid {} {}: {}", what, value, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalInfo {
    pub node: NodeId,
    /// Satellite-facing device
    pub device: DeviceId,
    pub mac: Mac48Address,
    /// Beam the terminal started in
    pub beam_id: u32,
}

/// JSON dump of the network state after a run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSnapshot {
    pub time_s: f64,
    pub nodes: Vec<NodeSnapshot>,
    pub terminals: Vec<TerminalInfo>,
    pub handovers: Vec<HandoverRecord>,
}

pub struct Scenario {
    network: Network,
    channels: BeamChannelProvisioner,
    directory: SharedDirectory,
    convergence: HandoverRouteConvergence<SharedDirectory>,
    queue: HandoverQueue,
    /// Configured handovers not yet handed to the queue, in time order
    scripted: Vec<HandoverEvent>,
    terminals: Vec<TerminalInfo>,
    beam_gateways: BTreeMap<u32, Mac48Address>,
    provisioning: Vec<BeamProvisioning>,
    backbone: GatewayBackbone,
    ut_users: Vec<NodeId>,
    satellites: Vec<Mac48Address>,
    topology: IslTopology,
    arbiters: Vec<IslUnicastArbiter>,
}

impl Scenario {
    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn channels(&self) -> &BeamChannelProvisioner {
        &self.channels
    }

    pub fn directory(&self) -> &SharedDirectory {
        &self.directory
    }

    pub fn queue(&self) -> &HandoverQueue {
        &self.queue
    }

    pub fn terminals(&self) -> &[TerminalInfo] {
        &self.terminals
    }

    pub fn terminal(&self, index: usize) -> Result<&TerminalInfo> {
        self.terminals
            .get(index)
            .ok_or(BeamError::UnknownTerminal(index))
    }

    /// Satellite-facing MAC of the gateway serving `beam_id`
    pub fn beam_gateway(&self, beam_id: u32) -> Result<Mac48Address> {
        self.beam_gateways
            .get(&beam_id)
            .copied()
            .ok_or(BeamError::UnknownBeam(beam_id))
    }

    pub fn provisioning(&self) -> &[BeamProvisioning] {
        &self.provisioning
    }

    pub fn backbone(&self) -> &GatewayBackbone {
        &self.backbone
    }

    pub fn ut_users(&self) -> &[NodeId] {
        &self.ut_users
    }

    /// Payload MAC of satellite `sat_id`
    pub fn satellite_mac(&self, sat_id: u32) -> Option<Mac48Address> {
        self.satellites.get(sat_id as usize).copied()
    }

    pub fn topology(&self) -> &IslTopology {
        &self.topology
    }

    pub fn arbiter(&self, sat_id: u32) -> Option<&IslUnicastArbiter> {
        self.arbiters.get(sat_id as usize)
    }

    /// Queue a move of terminal `index` to `beam_id`
    pub fn schedule_handover(&mut self, at: Duration, index: usize, beam_id: u32) -> Result<()> {
        let terminal = self.terminal(index)?.mac;
        let gateway = self.beam_gateway(beam_id)?;
        self.queue.schedule(at, terminal, gateway)?;
        Ok(())
    }

    /// Handovers queued or still waiting on an earlier one of their terminal
    pub fn pending_handovers(&self) -> usize {
        self.queue.len() + self.scripted.len()
    }

    /// Execute every handover due by `until`. A configured handover is
    /// queued once the previous one of its terminal has run, so events
    /// are executed one due time at a time.
    pub fn run_until(&mut self, until: Duration) -> Result<usize> {
        let mut executed = 0;
        loop {
            self.release_scripted()?;
            let due = match self.queue.next_due() {
                Some(at) if at <= until => at,
                _ => break,
            };
            executed += self.queue.run_until(
                due,
                &mut self.network,
                &self.channels,
                &mut self.convergence,
            )?;
        }
        executed += self.queue.run_until(
            until,
            &mut self.network,
            &self.channels,
            &mut self.convergence,
        )?;
        Ok(executed)
    }

    /// Queue the earliest configured handover of every terminal that has
    /// none pending
    fn release_scripted(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut waiting = Vec::with_capacity(self.scripted.len());
        for event in std::mem::take(&mut self.scripted) {
            if seen.insert(event.terminal) && !self.queue.is_pending(&event.terminal) {
                self.queue.schedule(event.at, event.terminal, event.new_gateway)?;
            } else {
                waiting.push(event);
            }
        }
        self.scripted = waiting;
        Ok(())
    }

    /// ISL interface satellite `sat_id` forwards `packet` on towards the
    /// satellite owning `destination`
    pub fn forward(
        &self,
        sat_id: u32,
        packet: &IslPacket,
        destination: &Mac48Address,
    ) -> Result<i32> {
        let arbiter = self
            .arbiter(sat_id)
            .ok_or(IslError::UnknownSatellite(sat_id))?;
        Ok(arbiter.base_decide(packet, destination)?)
    }

    /// Replace the ISL set and rebuild every forwarding table. ISL devices
    /// are not re-created.
    pub fn update_isls(&mut self, isls: &[(u32, u32)]) -> Result<()> {
        self.arbiters = self.topology.update(isls, &self.directory)?;
        Ok(())
    }

    pub fn snapshot(&self) -> ScenarioSnapshot {
        ScenarioSnapshot {
            time_s: self.queue.now().as_secs_f64(),
            nodes: self.network.snapshot(),
            terminals: self.terminals.clone(),
            handovers: self.queue.log().to_vec(),
        }
    }
}

/// Wires a [`Scenario`] from its configuration
pub struct ScenarioBuilder<'a> {
    config: &'a ScenarioConfig,
    network: Network,
    directory: IdDirectory,
    channels: BeamChannelProvisioner,
    queue: HandoverQueue,
    terminals: Vec<TerminalInfo>,
    beam_gateways: BTreeMap<u32, Mac48Address>,
    provisioning: Vec<BeamProvisioning>,
}

impl<'a> ScenarioBuilder<'a> {
    pub fn build(config: &'a ScenarioConfig) -> Result<Scenario> {
        config.validate()?;
        let topology = IslTopology::new(config.satellites, &config.isls)?;
        info!(
            "building scenario: {} beams, {} terminals, {} satellites",
            config.beams.len(),
            config.terminal_count(),
            config.satellites
        );

        let delay = duration_from_secs(config.propagation_delay_s, "propagation delay")?;
        let mut network = Network::new();
        let channels =
            BeamChannelProvisioner::new(&mut network, ConstantPropagationDelay::new(delay))?;
        let mut builder = ScenarioBuilder {
            config,
            network,
            directory: IdDirectory::new(),
            channels,
            queue: HandoverQueue::new(),
            terminals: Vec::new(),
            beam_gateways: BTreeMap::new(),
            provisioning: Vec::new(),
        };

        let ut_nodes = builder.create_terminals()?;
        let mut users = UserNetworkProvisioner::from_config(&config.pools.ut, &config.pools.gw)?;
        let ut_users = users.install_ut_users(
            &mut builder.network,
            &mut builder.directory,
            &ut_nodes,
            config.ut_users_per_terminal,
        )?;

        let payload_mac = builder.network.device(builder.channels.payload())?.mac;
        builder.directory.attach_satellite(payload_mac, 0)?;
        builder.install_beams(&ut_nodes)?;

        let gateways = builder.channels.gw_nodes().to_vec();
        let backbone = users.install_gw_users(
            &mut builder.network,
            &mut builder.directory,
            &gateways,
            config.gw_users,
        )?;
        set_routes_for_gws(&mut builder.network, &gateways)?;
        mirror_gateway_routes(&mut builder.network, &backbone)?;

        let satellites = builder.install_satellites(payload_mac)?;

        let directory: SharedDirectory = Arc::new(builder.directory);
        let arbiters = topology.build_arbiters(&directory)?;
        let mut scripted = Vec::with_capacity(config.handovers.len());
        for handover in &config.handovers {
            let terminal = builder
                .terminals
                .get(handover.terminal)
                .ok_or(BeamError::UnknownTerminal(handover.terminal))?;
            let new_gateway = builder
                .beam_gateways
                .get(&handover.beam_id)
                .copied()
                .ok_or(BeamError::UnknownBeam(handover.beam_id))?;
            scripted.push(HandoverEvent {
                at: duration_from_secs(handover.at_s, "handover time")?,
                terminal: terminal.mac,
                new_gateway,
            });
        }
        scripted.sort_by_key(|event| event.at);

        let mut scenario = Scenario {
            network: builder.network,
            channels: builder.channels,
            convergence: HandoverRouteConvergence::new(Arc::clone(&directory)),
            directory,
            queue: builder.queue,
            scripted,
            terminals: builder.terminals,
            beam_gateways: builder.beam_gateways,
            provisioning: builder.provisioning,
            backbone,
            ut_users,
            satellites,
            topology,
            arbiters,
        };

        scenario.release_scripted()?;
        info!(
            "scenario ready: {} nodes, {} handovers pending",
            scenario.network.nodes().count(),
            scenario.pending_handovers()
        );
        Ok(scenario)
    }

    fn create_terminals(&mut self) -> Result<Vec<NodeId>> {
        let nodes = (0..self.config.terminal_count())
            .map(|i| {
                let node = self
                    .network
                    .create_node(NodeKind::Terminal, format!("ut-{}", i + 1));
                self.network.install_ipv4(node).map(|_| node)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    fn install_beams(&mut self, ut_nodes: &[NodeId]) -> Result<()> {
        let config = self.config;
        let mut beams = BeamRouteProvisioner::from_config(&config.pools.beam)?;
        let mut next_terminal = 0;

        for beam_config in &config.beams {
            let beam = self.channels.install_beam(
                &mut self.network,
                beam_config.beam_id,
                beam_config.gw_id,
                beam_config.user_freq_id,
                beam_config.feeder_freq_id,
            )?;
            let (beam_id, gw_id, gw_node) = (beam.beam_id, beam.gw_id, beam.gw_node);

            let gw_dev = self
                .network
                .add_device(gw_node, DeviceKind::Satellite { beam_id })?;
            let gw_mac = self.network.device(gw_dev)?.mac;
            self.directory.attach_gateway(gw_mac, gw_id)?;
            self.directory.attach_beam(gw_mac, beam_id)?;

            let terminals = &ut_nodes[next_terminal..next_terminal + beam_config.terminals];
            next_terminal += beam_config.terminals;
            let mut ut_devs = Vec::with_capacity(terminals.len());
            for node in terminals {
                let dev = self
                    .network
                    .add_device(*node, DeviceKind::Satellite { beam_id })?;
                let mac = self.network.device(dev)?.mac;
                self.directory.attach_terminal(mac)?;
                self.directory.attach_beam(mac, beam_id)?;
                ut_devs.push(dev);
            }

            let provisioning =
                beams.provision_beam(&mut self.network, terminals, &ut_devs, gw_node, gw_dev)?;

            let (forward_feeder, return_user) = self
                .channels
                .delay_models(beam_id)
                .ok_or(BeamError::UnknownBeam(beam_id))?;
            for (node, dev) in terminals.iter().zip(&ut_devs) {
                let device = self.network.device_mut(*dev)?;
                device
                    .timing_advance
                    .set_delay_models(forward_feeder.clone(), return_user.clone());
                let mac = device.mac;
                self.queue.set_serving(mac, gw_mac);
                self.terminals.push(TerminalInfo {
                    node: *node,
                    device: *dev,
                    mac,
                    beam_id,
                });
            }

            self.beam_gateways.insert(beam_id, gw_mac);
            self.provisioning.push(provisioning);
        }
        Ok(())
    }

    /// Satellites 1.. with their payload devices, then one ISL device per
    /// ISL end in declaration order
    fn install_satellites(&mut self, payload_mac: Mac48Address) -> Result<Vec<Mac48Address>> {
        let mut nodes = vec![self.channels.satellite()];
        let mut macs = vec![payload_mac];
        for sat_id in 1..self.config.satellites {
            let node = self
                .network
                .create_node(NodeKind::Satellite, format!("sat-{}", sat_id));
            let payload = self.network.add_device(node, DeviceKind::Payload)?;
            let mac = self.network.device(payload)?.mac;
            self.directory.attach_satellite(mac, sat_id as u32)?;
            nodes.push(node);
            macs.push(mac);
        }

        for (a, b) in &self.config.isls {
            for sat_id in [*a, *b] {
                let node = nodes
                    .get(sat_id as usize)
                    .copied()
                    .ok_or(IslError::UnknownSatellite(sat_id))?;
                self.network.add_device(node, DeviceKind::Isl)?;
            }
            debug!("ISL sat {} <-> sat {}", a, b);
        }
        Ok(macs)
    }
}
