use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::models::{OrganizationCandidate, RawUsage};
use crate::poller::{SourceError, UsageSource};

const API_BASE: &str = "https://claude.ai/api";

/// claude.ai web API, authenticated with the browser's `sessionKey` cookie.
pub struct ClaudeWebClient {
    agent: ureq::Agent,
    base_url: String,
    session_key: String,
}

impl ClaudeWebClient {
    pub fn new(session_key: String) -> Result<Self, SourceError> {
        Self::with_base_url(session_key, API_BASE)
    }

    pub fn with_base_url(session_key: String, base_url: &str) -> Result<Self, SourceError> {
        let tls = Arc::new(
            native_tls::TlsConnector::new().map_err(|e| SourceError::Transport(e.to_string()))?,
        );
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .tls_connector(tls)
            .build();

        Ok(Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_key,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = format!("{}{path}", self.base_url);
        tracing::debug!(%url, "GET");

        let response = match self
            .agent
            .get(&url)
            .set("Cookie", &format!("sessionKey={}", self.session_key))
            .set("Accept", "application/json")
            .call()
        {
            Ok(resp) => resp,
            Err(ureq::Error::Status(status, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                return Err(SourceError::Status {
                    status,
                    message: extract_error_message(&body),
                });
            }
            Err(e) => return Err(SourceError::Transport(e.to_string())),
        };

        response
            .into_json()
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}

impl UsageSource for ClaudeWebClient {
    fn list_organizations(&self) -> Result<Vec<OrganizationCandidate>, SourceError> {
        self.get_json("/organizations")
    }

    fn fetch_usage(&self, org_id: &str) -> Result<RawUsage, SourceError> {
        self.get_json(&format!("/organizations/{org_id}/usage"))
    }
}

fn extract_error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = json.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    body.chars().take(200).collect()
}
