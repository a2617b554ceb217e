//! Classified-traffic record shape returned by the upstream predictor
//! (spec.md §6 classification wire).

use serde::{Deserialize, Serialize};

/// A classification result for one (server addr, server port, protocol) key.
///
/// Field names match the upstream predictor's JSON body exactly
/// (`Application`, `ApplicationName`, ...) so the wire payload decodes
/// without renaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedTraffic {
    #[serde(rename = "Application")]
    pub application: String,
    #[serde(rename = "ApplicationName")]
    pub application_name: String,
    #[serde(rename = "Confidence")]
    pub confidence: u32,
    #[serde(rename = "Protocolchain")]
    pub protocol_chain: String,
    #[serde(rename = "ApplicationProductivity")]
    pub productivity: String,
    #[serde(rename = "ApplicationRisk")]
    pub risk: String,
    #[serde(rename = "ApplicationCategory")]
    pub category: String,
}

impl ClassifiedTraffic {
    /// Well-known sentinel cached for non-answering or non-200 endpoints,
    /// so repeat lookups are suppressed within the cache TTL (spec.md §4.6).
    pub fn unknown() -> Self {
        Self {
            application: "unknown".to_string(),
            application_name: "Unknown".to_string(),
            confidence: 0,
            protocol_chain: "unknown".to_string(),
            productivity: "unknown".to_string(),
            risk: "unknown".to_string(),
            category: "unknown".to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.application == "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wire_json() {
        let body = r#"{"Application":"17","ApplicationName":"HTTPS","Confidence":95,
            "Protocolchain":"ip/tcp/tls","ApplicationProductivity":"High",
            "ApplicationRisk":"Low","ApplicationCategory":"Web"}"#;
        let got: ClassifiedTraffic = serde_json::from_str(body).unwrap();
        assert_eq!(got.application_name, "HTTPS");
        assert_eq!(got.confidence, 95);
        assert!(!got.is_unknown());
    }

    #[test]
    fn unknown_sentinel_is_marked() {
        assert!(ClassifiedTraffic::unknown().is_unknown());
    }
}
