use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::device::error::TransportError;

/// One mutex per device serial. A session holds its device's mutex from
/// device selection until cleanup, so two sessions never share a device.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    devices: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, serial: &str) -> Result<Arc<Mutex<()>>, TransportError> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| TransportError::Command("device lock table poisoned".to_owned()))?;
        Ok(Arc::clone(devices.entry(serial.to_owned()).or_default()))
    }
}
