//! [`ChannelRegistry`] – process-wide channel ownership.
//!
//! Every open channel is claimed by exactly one device. A second claim on the
//! same identifier fails with [`HardwareError::AlreadyInUse`] naming the
//! current owner. The claim lives inside the [`ChannelLease`] handed to the
//! controller and is released when the lease is dropped, so a controller that
//! loses its channel or disconnects never leaves a stale claim behind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lasercore_types::{DeviceConfig, DeviceKind, HardwareError};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::channel::{Channel, ChannelOpener};

#[derive(Clone, Default)]
pub struct ChannelRegistry {
    claims: Arc<Mutex<HashMap<String, DeviceKind>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `channel_id` for `owner` and open it.
    ///
    /// The claim is taken before the channel is opened and rolled back if the
    /// open fails.
    pub fn acquire(
        &self,
        channel_id: &str,
        owner: DeviceKind,
        opener: &dyn ChannelOpener,
        settings: &DeviceConfig,
    ) -> Result<ChannelLease, HardwareError> {
        {
            let mut claims = self.claims.lock();
            if let Some(current) = claims.get(channel_id) {
                return Err(HardwareError::AlreadyInUse {
                    channel: channel_id.to_string(),
                    owner: current.to_string(),
                });
            }
            claims.insert(channel_id.to_string(), owner);
        }

        match opener.open(channel_id, settings) {
            Ok(channel) => {
                info!(channel = channel_id, device = %owner, "channel claimed");
                Ok(ChannelLease {
                    channel_id: channel_id.to_string(),
                    owner,
                    claims: Arc::clone(&self.claims),
                    channel,
                })
            }
            Err(e) => {
                self.claims.lock().remove(channel_id);
                Err(e.into_hardware(owner, "open", settings.command_timeout()))
            }
        }
    }

    /// Current owner of `channel_id`, if claimed.
    pub fn owner_of(&self, channel_id: &str) -> Option<DeviceKind> {
        self.claims.lock().get(channel_id).copied()
    }

    pub fn claimed(&self) -> usize {
        self.claims.lock().len()
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("claims", &*self.claims.lock())
            .finish()
    }
}

/// An open channel plus its ownership claim.
pub struct ChannelLease {
    channel_id: String,
    owner: DeviceKind,
    claims: Arc<Mutex<HashMap<String, DeviceKind>>>,
    channel: Box<dyn Channel>,
}

impl ChannelLease {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn owner(&self) -> DeviceKind {
        self.owner
    }

    pub fn channel_mut(&mut self) -> &mut dyn Channel {
        self.channel.as_mut()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.channel_id);
        debug!(channel = %self.channel_id, device = %self.owner, "channel released");
    }
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("channel_id", &self.channel_id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
