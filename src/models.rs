use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One quota window as exchanged between the poller and the relay.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageWindow {
    pub utilization: f64,
    pub resets_at: String,
}

/// The single record pushed to the relay and cached on disk.
///
/// Decoding is lenient: the relay accepts any JSON object and missing fields
/// fall back to their defaults, so a snapshot decoded from a foreign payload
/// may carry an empty `updated_at`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageSnapshot {
    pub five_hour: UsageWindow,
    pub seven_day: Option<UsageWindow>,
    pub updated_at: String,
}

impl UsageSnapshot {
    pub fn new(five_hour: UsageWindow, seven_day: Option<UsageWindow>, at: DateTime<Utc>) -> Self {
        Self {
            five_hour,
            seven_day,
            updated_at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.updated_at)
    }
}

/// A quota section as returned by the upstream usage endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawWindow {
    pub utilization: Option<f64>,
    pub resets_at: Option<String>,
}

/// Upstream usage payload. Both sections are optional on the wire.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawUsage {
    pub five_hour: Option<RawWindow>,
    pub seven_day: Option<RawWindow>,
}

/// An upstream account as listed by the organizations endpoint.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OrganizationCandidate {
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub billing_type: Option<String>,
    #[serde(default)]
    pub raven_type: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

impl OrganizationCandidate {
    pub fn capabilities(&self) -> &[String] {
        self.capabilities.as_deref().unwrap_or_default()
    }
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serializes_camel_case_with_null_seven_day() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let snapshot = UsageSnapshot::new(
            UsageWindow {
                utilization: 45.0,
                resets_at: "2025-01-01T10:00:00Z".into(),
            },
            None,
            at,
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["fiveHour"]["utilization"], 45.0);
        assert_eq!(json["fiveHour"]["resetsAt"], "2025-01-01T10:00:00Z");
        assert!(json["sevenDay"].is_null());
        assert_eq!(json["updatedAt"], "2025-01-01T09:00:00.000Z");
        assert_eq!(snapshot.updated_at(), Some(at));
    }

    #[test]
    fn empty_object_decodes_to_default_snapshot() {
        let snapshot: UsageSnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(snapshot, UsageSnapshot::default());
        assert_eq!(snapshot.updated_at(), None);
    }

    #[test]
    fn candidate_tolerates_null_tags() {
        let org: OrganizationCandidate = serde_json::from_str(
            r#"{"uuid":"abc","name":"Personal","billing_type":null,"raven_type":null,"capabilities":null}"#,
        )
        .unwrap();
        assert_eq!(org.uuid, "abc");
        assert!(org.billing_type.is_none());
        assert!(org.capabilities().is_empty());
    }
}
