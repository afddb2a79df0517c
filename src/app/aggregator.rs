use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::adapters::probe::Probe;
use crate::domain::models::Device;

/// Collection waits this long past the probe timeout, so a probe that gives
/// up on time is reported as its own result rather than as a missing one.
const COLLECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("no monitored devices configured")]
    NoDevices,
}

/// Folds per-device reachability into one "power present" reading: power is
/// present while any device answers, absent only when none does.
pub struct Aggregator {
    devices: Vec<Device>,
    probe: Arc<dyn Probe>,
    probe_timeout: Duration,
}

impl Aggregator {
    pub fn new(
        devices: Vec<Device>,
        probe: Arc<dyn Probe>,
        probe_timeout: Duration,
    ) -> Result<Self, AggregatorError> {
        if devices.is_empty() {
            return Err(AggregatorError::NoDevices);
        }

        Ok(Self {
            devices,
            probe,
            probe_timeout,
        })
    }

    /// Probes every device on its own thread against a shared deadline and
    /// returns as soon as one answers. Probes are expected to bound themselves
    /// by `probe_timeout`; the deadline only cuts off ones that do not.
    pub fn evaluate(&self) -> bool {
        let (sender, receiver) = mpsc::channel();

        for (index, device) in self.devices.iter().enumerate() {
            let sender = sender.clone();
            let probe = Arc::clone(&self.probe);
            let address = device.address.clone();
            let timeout = self.probe_timeout;

            let spawned = thread::Builder::new()
                .name(format!("probe-{index}"))
                .spawn(move || {
                    let result = probe.is_reachable(&address, timeout);
                    let _ = sender.send((index, result));
                });

            if let Err(error) = spawned {
                tracing::warn!(
                    device = %device.name,
                    error = %error,
                    "failed to spawn probe thread; counting device as unreachable"
                );
            }
        }
        drop(sender);

        let deadline = Instant::now() + self.probe_timeout + COLLECT_GRACE;
        let mut answered = vec![false; self.devices.len()];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining) {
                Ok((index, result)) => {
                    answered[index] = true;
                    let device = &self.devices[index];
                    match result {
                        Ok(true) => {
                            tracing::debug!(
                                device = %device.name,
                                address = %device.address,
                                "device reachable"
                            );
                            return true;
                        }
                        Ok(false) => tracing::debug!(
                            device = %device.name,
                            address = %device.address,
                            "device not reachable"
                        ),
                        Err(error) => tracing::debug!(
                            device = %device.name,
                            address = %device.address,
                            error = %error,
                            "probe failed; counting device as unreachable"
                        ),
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    for (device, _) in self
                        .devices
                        .iter()
                        .zip(&answered)
                        .filter(|(_, answered)| !**answered)
                    {
                        tracing::debug!(
                            device = %device.name,
                            address = %device.address,
                            timeout_ms = self.probe_timeout.as_millis() as u64,
                            "probe timed out; counting device as unreachable"
                        );
                    }
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        false
    }
}
