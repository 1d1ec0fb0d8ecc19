//! Camera acquisition as a capability.
//!
//! Frame handling belongs to the vendor SDK outside the core; the core only
//! switches acquisition on and off, and never as part of a safety shutdown.

use std::sync::atomic::{AtomicBool, Ordering};

use lasercore_middleware::Notifier;
use lasercore_types::{DeviceKind, DeviceNotification, HardwareError};

use crate::controller::DeviceNotifier;

pub trait CameraCapability: Send + Sync {
    fn enable(&self) -> Result<(), HardwareError>;

    fn disable(&self) -> Result<(), HardwareError>;

    fn is_acquiring(&self) -> bool;
}

/// Camera stand-in that only tracks the acquisition flag.
#[derive(Debug)]
pub struct SimCamera {
    acquiring: AtomicBool,
    notifier: DeviceNotifier,
}

impl SimCamera {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            acquiring: AtomicBool::new(false),
            notifier: DeviceNotifier::new(DeviceKind::Camera, notifier),
        }
    }

    fn set(&self, acquiring: bool) {
        if self.acquiring.swap(acquiring, Ordering::SeqCst) != acquiring {
            self.notifier
                .emit(DeviceNotification::AcquisitionChanged { acquiring });
        }
    }
}

impl CameraCapability for SimCamera {
    fn enable(&self) -> Result<(), HardwareError> {
        self.set(true);
        Ok(())
    }

    fn disable(&self) -> Result<(), HardwareError> {
        self.set(false);
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }
}
