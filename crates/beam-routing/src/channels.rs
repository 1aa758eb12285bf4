//! Beam channel provisioning
//!
//! User-link channel pairs are keyed by user frequency id and feeder-link
//! pairs by feeder frequency id, so beams on the same frequency share
//! channels. Gateway nodes are created on first use of a gateway id.

use crate::{BeamError, Result};
use sat_netstack::{
    ChannelPair, ConstantPropagationDelay, DelayHandle, DeviceId, DeviceKind, LinkKind, Network,
    NodeId, NodeKind, SatChannel,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Source of the delay handles a terminal's timing advance needs
pub trait BeamDelays {
    /// Forward feeder and return user delay handles of `beam_id`
    fn delay_models(&self, beam_id: u32) -> Option<(DelayHandle, DelayHandle)>;
}

#[derive(Debug, Clone)]
pub struct Beam {
    pub beam_id: u32,
    pub gw_id: u32,
    pub user_freq_id: u32,
    pub feeder_freq_id: u32,
    pub gw_node: NodeId,
    pub user: ChannelPair,
    pub feeder: ChannelPair,
}

pub struct BeamChannelProvisioner {
    propagation: ConstantPropagationDelay,
    next_channel_id: u32,
    satellite: NodeId,
    payload: DeviceId,
    user_channels: BTreeMap<u32, ChannelPair>,
    feeder_channels: BTreeMap<u32, ChannelPair>,
    gw_nodes: BTreeMap<u32, NodeId>,
    gw_order: Vec<NodeId>,
    beams: BTreeMap<u32, Beam>,
    gw_links: HashSet<(u32, u32)>,
}

impl BeamChannelProvisioner {
    /// Creates the satellite (id 0) carrying every beam
    pub fn new(network: &mut Network, propagation: ConstantPropagationDelay) -> Result<Self> {
        let satellite = network.create_node(NodeKind::Satellite, "sat-0");
        let payload = network.add_device(satellite, DeviceKind::Payload)?;
        Ok(Self {
            propagation,
            next_channel_id: 0,
            satellite,
            payload,
            user_channels: BTreeMap::new(),
            feeder_channels: BTreeMap::new(),
            gw_nodes: BTreeMap::new(),
            gw_order: Vec::new(),
            beams: BTreeMap::new(),
            gw_links: HashSet::new(),
        })
    }

    pub fn satellite(&self) -> NodeId {
        self.satellite
    }

    pub fn payload(&self) -> DeviceId {
        self.payload
    }

    pub fn install_beam(
        &mut self,
        network: &mut Network,
        beam_id: u32,
        gw_id: u32,
        user_freq_id: u32,
        feeder_freq_id: u32,
    ) -> Result<&Beam> {
        if self.beams.contains_key(&beam_id) {
            return Err(BeamError::DuplicateBeam(beam_id));
        }
        if self.gw_links.contains(&(gw_id, feeder_freq_id)) {
            return Err(BeamError::DuplicateGatewayLink {
                gw_id,
                feeder_freq_id,
            });
        }

        let gw_node = match self.gw_nodes.get(&gw_id) {
            Some(node) => *node,
            None => {
                let node = network.create_node(NodeKind::Gateway, format!("gw-{}", gw_id));
                network.install_ipv4(node)?;
                self.gw_nodes.insert(gw_id, node);
                self.gw_order.push(node);
                info!("created gateway {} as {}", gw_id, node);
                node
            }
        };

        let user = self.channel_pair(LinkKind::User, user_freq_id);
        let feeder = self.channel_pair(LinkKind::Feeder, feeder_freq_id);

        self.gw_links.insert((gw_id, feeder_freq_id));
        debug!("beam {} attached to payload {}", beam_id, self.payload);
        info!(
            "installed beam {} (gw {}, user freq {}, feeder freq {})",
            beam_id, gw_id, user_freq_id, feeder_freq_id
        );

        let beam = self.beams.entry(beam_id).or_insert(Beam {
            beam_id,
            gw_id,
            user_freq_id,
            feeder_freq_id,
            gw_node,
            user,
            feeder,
        });
        Ok(beam)
    }

    fn channel_pair(&mut self, link: LinkKind, frequency_id: u32) -> ChannelPair {
        let channels = match link {
            LinkKind::User => &mut self.user_channels,
            LinkKind::Feeder => &mut self.feeder_channels,
        };
        if let Some(pair) = channels.get(&frequency_id) {
            debug!("reusing {:?} channels for frequency {}", link, frequency_id);
            return pair.clone();
        }

        // one delay model per pair, shared by its forward and return channel
        let delay = self.propagation.handle();
        let fwd_id = self.next_channel_id;
        self.next_channel_id += 2;
        let pair = ChannelPair {
            fwd: Arc::new(SatChannel::new(fwd_id, link, frequency_id, Arc::clone(&delay))),
            rtn: Arc::new(SatChannel::new(fwd_id + 1, link, frequency_id, delay)),
        };
        debug!("created {:?} channels for frequency {}", link, frequency_id);
        channels.insert(frequency_id, pair.clone());
        pair
    }

    pub fn beam(&self, beam_id: u32) -> Option<&Beam> {
        self.beams.get(&beam_id)
    }

    pub fn beams(&self) -> impl Iterator<Item = &Beam> {
        self.beams.values()
    }

    pub fn gw_node(&self, gw_id: u32) -> Option<NodeId> {
        self.gw_nodes.get(&gw_id).copied()
    }

    /// Gateway nodes in creation order
    pub fn gw_nodes(&self) -> &[NodeId] {
        &self.gw_order
    }
}

impl BeamDelays for BeamChannelProvisioner {
    fn delay_models(&self, beam_id: u32) -> Option<(DelayHandle, DelayHandle)> {
        let beam = self.beams.get(&beam_id)?;
        Some((beam.feeder.fwd.delay_model(), beam.user.rtn.delay_model()))
    }
}
