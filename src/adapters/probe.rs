use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

const WAIT_STEP: Duration = Duration::from_millis(50);
/// Slack past the probe timeout before the process is killed, so ping's own
/// exit wins when it finishes on schedule.
const KILL_GRACE: Duration = Duration::from_millis(250);

pub trait Probe: Send + Sync + 'static {
    fn is_reachable(&self, address: &str, timeout: Duration) -> Result<bool, ProbeError>;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for probe process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("probe did not finish within {0:?}")]
    Timeout(Duration),
}

/// ICMP reachability through the system `ping` binary. Any echo reply counts.
#[derive(Debug, Clone)]
pub struct PingProbe {
    binary: String,
    count: u32,
}

impl PingProbe {
    pub fn new(count: u32) -> Self {
        Self::with_binary("ping", count)
    }

    pub fn with_binary(binary: impl Into<String>, count: u32) -> Self {
        Self {
            binary: binary.into(),
            count: count.max(1),
        }
    }

    /// `-W` bounds the wait for each reply, unlike `-w`, which makes ping
    /// fail unless every one of `count` replies arrives before the deadline.
    /// Echoes go out one second apart, so the last reply window is what is
    /// left of the timeout after `count - 1` seconds.
    fn args(&self, address: &str, timeout: Duration) -> Vec<String> {
        let reply_wait = timeout
            .as_secs()
            .saturating_sub(u64::from(self.count - 1))
            .max(1);
        vec![
            "-n".to_string(),
            "-q".to_string(),
            "-c".to_string(),
            self.count.to_string(),
            "-W".to_string(),
            reply_wait.to_string(),
            address.to_string(),
        ]
    }
}

impl Probe for PingProbe {
    fn is_reachable(&self, address: &str, timeout: Duration) -> Result<bool, ProbeError> {
        let mut child = Command::new(&self.binary)
            .args(self.args(address, timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let deadline = Instant::now() + timeout + KILL_GRACE;
        loop {
            if let Some(status) = child.try_wait().map_err(ProbeError::Wait)? {
                return Ok(status.success());
            }
            if Instant::now() >= deadline {
                if let Err(error) = child.kill() {
                    tracing::debug!(address, error = %error, "failed to kill timed out ping");
                }
                let _ = child.wait();
                return Err(ProbeError::Timeout(timeout));
            }
            thread::sleep(WAIT_STEP);
        }
    }
}
