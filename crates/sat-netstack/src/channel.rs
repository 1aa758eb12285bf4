//! Satellite channels and propagation-delay handles
//!
//! Channels are shared between every device of a beam (and between beams
//! reusing a frequency), so the delay model travels as an `Arc` handle.
//! The timing-advance observer of a terminal only keeps the handles; the
//! delay is read when asked for.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Average UT/GW to satellite propagation delay
pub const DEFAULT_PROPAGATION_DELAY_S: f64 = 0.13;

pub trait PropagationDelayModel: fmt::Debug + Send + Sync {
    fn delay(&self) -> Duration;
}

pub type DelayHandle = Arc<dyn PropagationDelayModel>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantPropagationDelay {
    delay: Duration,
}

impl ConstantPropagationDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Negative and NaN delays clamp to zero, oversized ones saturate
    pub fn from_secs_f64(seconds: f64) -> Self {
        Self::new(Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX))
    }

    pub fn handle(self) -> DelayHandle {
        Arc::new(self)
    }
}

impl Default for ConstantPropagationDelay {
    fn default() -> Self {
        Self::from_secs_f64(DEFAULT_PROPAGATION_DELAY_S)
    }
}

impl PropagationDelayModel for ConstantPropagationDelay {
    fn delay(&self) -> Duration {
        self.delay
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkKind {
    /// UT <-> satellite
    User,
    /// GW <-> satellite
    Feeder,
}

#[derive(Debug)]
pub struct SatChannel {
    pub id: u32,
    pub link: LinkKind,
    pub frequency_id: u32,
    delay: DelayHandle,
}

impl SatChannel {
    pub fn new(id: u32, link: LinkKind, frequency_id: u32, delay: DelayHandle) -> Self {
        Self {
            id,
            link,
            frequency_id,
            delay,
        }
    }

    pub fn delay_model(&self) -> DelayHandle {
        Arc::clone(&self.delay)
    }
}

/// Forward / return channels for one frequency of one link kind
#[derive(Debug, Clone)]
pub struct ChannelPair {
    pub fwd: Arc<SatChannel>,
    pub rtn: Arc<SatChannel>,
}

impl ChannelPair {
    pub fn same_as(&self, other: &ChannelPair) -> bool {
        Arc::ptr_eq(&self.fwd, &other.fwd) && Arc::ptr_eq(&self.rtn, &other.rtn)
    }
}

/// Delay handles a terminal uses to compute its timing advance
#[derive(Debug, Clone, Default)]
pub struct TimingAdvance {
    forward_feeder: Option<DelayHandle>,
    return_user: Option<DelayHandle>,
}

impl TimingAdvance {
    pub fn set_delay_models(&mut self, forward_feeder: DelayHandle, return_user: DelayHandle) {
        self.forward_feeder = Some(forward_feeder);
        self.return_user = Some(return_user);
    }

    pub fn is_configured(&self) -> bool {
        self.forward_feeder.is_some() && self.return_user.is_some()
    }

    pub fn forward_feeder_delay(&self) -> Option<Duration> {
        self.forward_feeder.as_ref().map(|d| d.delay())
    }

    pub fn return_user_delay(&self) -> Option<Duration> {
        self.return_user.as_ref().map(|d| d.delay())
    }

    /// Sum of both legs, once both handles are set
    pub fn total_delay(&self) -> Option<Duration> {
        Some(
            self.forward_feeder_delay()?
                .saturating_add(self.return_user_delay()?),
        )
    }

    pub fn uses(&self, forward_feeder: &DelayHandle, return_user: &DelayHandle) -> bool {
        matches!(
            (&self.forward_feeder, &self.return_user),
            (Some(f), Some(r)) if Arc::ptr_eq(f, forward_feeder) && Arc::ptr_eq(r, return_user)
        )
    }
}
