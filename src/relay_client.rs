use std::time::Duration;

use crate::models::UsageSnapshot;
use crate::poller::{RelayError, UsageSink};

/// Pushes snapshots to a relay on this machine.
pub struct RelayClient {
    agent: ureq::Agent,
    url: String,
}

impl RelayClient {
    pub fn new(port: u16) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(5))
            .build();
        Self {
            agent,
            url: format!("http://127.0.0.1:{port}/usage"),
        }
    }
}

impl UsageSink for RelayClient {
    fn push(&self, snapshot: &UsageSnapshot) -> Result<(), RelayError> {
        match self.agent.post(&self.url).send_json(snapshot) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(RelayError::Unreachable(format!("HTTP {code}"))),
            Err(e) => Err(RelayError::Unreachable(e.to_string())),
        }
    }
}
