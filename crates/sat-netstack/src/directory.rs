//! MAC to role directory
//!
//! Populated while the scenario is built, read-only afterwards. The
//! convergence and ISL code receive it through their constructors as a
//! [`RoleDirectory`]; `reset` clears it between independent runs.

use crate::{Mac48Address, NetStackError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Terminal { ut_id: u32 },
    Gateway { gw_id: u32 },
    Satellite { sat_id: u32 },
    TerminalUser { user_id: u32 },
    GatewayUser { user_id: u32 },
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Terminal { ut_id } => write!(f, "UT {}", ut_id),
            Role::Gateway { gw_id } => write!(f, "GW {}", gw_id),
            Role::Satellite { sat_id } => write!(f, "SAT {}", sat_id),
            Role::TerminalUser { user_id } => write!(f, "UT user {}", user_id),
            Role::GatewayUser { user_id } => write!(f, "GW user {}", user_id),
        }
    }
}

pub trait RoleDirectory {
    fn resolve(&self, mac: &Mac48Address) -> Option<Role>;

    /// Beam the address was attached to at build time
    fn beam_id(&self, mac: &Mac48Address) -> Option<u32>;

    fn terminal_id(&self, mac: &Mac48Address) -> Option<u32> {
        match self.resolve(mac)? {
            Role::Terminal { ut_id } => Some(ut_id),
            _ => None,
        }
    }

    fn gateway_id(&self, mac: &Mac48Address) -> Option<u32> {
        match self.resolve(mac)? {
            Role::Gateway { gw_id } => Some(gw_id),
            _ => None,
        }
    }

    fn satellite_id(&self, mac: &Mac48Address) -> Option<u32> {
        match self.resolve(mac)? {
            Role::Satellite { sat_id } => Some(sat_id),
            _ => None,
        }
    }
}

impl<T: RoleDirectory + ?Sized> RoleDirectory for Arc<T> {
    fn resolve(&self, mac: &Mac48Address) -> Option<Role> {
        (**self).resolve(mac)
    }

    fn beam_id(&self, mac: &Mac48Address) -> Option<u32> {
        (**self).beam_id(mac)
    }
}

impl<T: RoleDirectory + ?Sized> RoleDirectory for &T {
    fn resolve(&self, mac: &Mac48Address) -> Option<Role> {
        (**self).resolve(mac)
    }

    fn beam_id(&self, mac: &Mac48Address) -> Option<u32> {
        (**self).beam_id(mac)
    }
}

pub type SharedDirectory = Arc<dyn RoleDirectory + Send + Sync>;

#[derive(Debug, Clone)]
pub struct IdDirectory {
    roles: HashMap<Mac48Address, Role>,
    beams: HashMap<Mac48Address, u32>,
    next_ut_id: u32,
    next_ut_user_id: u32,
    next_gw_user_id: u32,
}

impl Default for IdDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl IdDirectory {
    pub fn new() -> Self {
        Self {
            roles: HashMap::new(),
            beams: HashMap::new(),
            next_ut_id: 1,
            next_ut_user_id: 1,
            next_gw_user_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    fn attach(&mut self, mac: Mac48Address, role: Role) -> Result<()> {
        if let Some(existing) = self.roles.get(&mac) {
            return Err(NetStackError::DuplicateAttachment {
                mac,
                existing: existing.to_string(),
            });
        }
        self.roles.insert(mac, role);
        Ok(())
    }

    /// Attach a terminal; ids are handed out from 1 in attach order
    pub fn attach_terminal(&mut self, mac: Mac48Address) -> Result<u32> {
        let ut_id = self.next_ut_id;
        self.attach(mac, Role::Terminal { ut_id })?;
        self.next_ut_id += 1;
        Ok(ut_id)
    }

    pub fn attach_gateway(&mut self, mac: Mac48Address, gw_id: u32) -> Result<()> {
        self.attach(mac, Role::Gateway { gw_id })
    }

    pub fn attach_satellite(&mut self, mac: Mac48Address, sat_id: u32) -> Result<()> {
        self.attach(mac, Role::Satellite { sat_id })
    }

    pub fn attach_terminal_user(&mut self, mac: Mac48Address) -> Result<u32> {
        let user_id = self.next_ut_user_id;
        self.attach(mac, Role::TerminalUser { user_id })?;
        self.next_ut_user_id += 1;
        Ok(user_id)
    }

    pub fn attach_gateway_user(&mut self, mac: Mac48Address) -> Result<u32> {
        let user_id = self.next_gw_user_id;
        self.attach(mac, Role::GatewayUser { user_id })?;
        self.next_gw_user_id += 1;
        Ok(user_id)
    }

    pub fn attach_beam(&mut self, mac: Mac48Address, beam_id: u32) -> Result<()> {
        if let Some(existing) = self.beams.get(&mac) {
            return Err(NetStackError::DuplicateAttachment {
                mac,
                existing: format!("beam {}", existing),
            });
        }
        self.beams.insert(mac, beam_id);
        Ok(())
    }

    /// Forget every attachment and restart id numbering
    pub fn reset(&mut self) {
        info!("resetting id directory ({} roles)", self.roles.len());
        *self = Self::new();
    }
}

impl RoleDirectory for IdDirectory {
    fn resolve(&self, mac: &Mac48Address) -> Option<Role> {
        self.roles.get(mac).copied()
    }

    fn beam_id(&self, mac: &Mac48Address) -> Option<u32> {
        self.beams.get(mac).copied()
    }
}
