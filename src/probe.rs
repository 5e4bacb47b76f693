use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{Context, bail};
use tracing::info;

use crate::errors::ToolError;
use crate::input::Node;
use crate::ops::Transport;

/// Reachability checks with bounded retries.
///
/// Freshly provisioned or rebooted machines take unpredictable but
/// bounded time to accept connections, hence a fixed number of
/// attempts with a fixed delay rather than a single shot.
#[derive(Debug)]
pub struct Prober {
    attempts: u32,
    delay: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self { attempts: 3, delay: Duration::from_secs(5) }
    }
}

impl Prober {
    /// A prober that does not sleep between attempts. For tests.
    #[must_use]
    pub const fn immediate() -> Self {
        Self { attempts: 3, delay: Duration::ZERO }
    }

    /// Probe a node until it answers or attempts run out. Only the
    /// final failure is reported; earlier ones are logged as retries.
    pub fn check_up(
        &self,
        name: &str,
        node: &Node,
        transport: &dyn Transport,
    ) -> Result<()> {
        if node.ip.is_empty() {
            bail!(ToolError::Unreachable(format!(
                "{name} (no ip address)"
            )));
        }

        for attempt in 1..=self.attempts {
            match transport.probe(&node.ip) {
                Ok(()) => {
                    info!("{name} is up");
                    return Ok(());
                }
                Err(_) if attempt < self.attempts => {
                    info!(
                        "{name} not answering (attempt {attempt}/{}), \
                         retrying in {}s",
                        self.attempts,
                        self.delay.as_secs(),
                    );
                    std::thread::sleep(self.delay);
                }
                Err(err) => {
                    return Err(err).wrap_err(ToolError::Unreachable(
                        name.to_string(),
                    ));
                }
            }
        }
        unreachable!("loop returns on the final attempt")
    }
}
