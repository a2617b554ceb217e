//! `classify` plugin (SPEC_FULL.md §2.13, priority 50, "low" per
//! spec.md §4.3).
//!
//! Hands the flow's key to the classification service and releases
//! immediately; a cache hit resolves inline, a miss is awaited on a
//! spawned task so the dispatch thread is never held on the upstream
//! round trip.

use std::sync::Arc;

use async_trait::async_trait;

use crate::classify::{ClassificationService, ClassifyKey};
use crate::pipeline::{Plugin, PluginMessage, PluginOutcome};
use crate::session::Session;

pub struct ClassifyPlugin {
    service: Arc<ClassificationService>,
}

impl ClassifyPlugin {
    pub fn new(service: Arc<ClassificationService>) -> Self {
        ClassifyPlugin { service }
    }
}

fn attach(session: &Session, traffic: &sentry_common::ClassifiedTraffic) {
    session.set_attribute("classify_application", &traffic.application);
    session.set_attribute("classify_application_name", &traffic.application_name);
    session.set_attribute("classify_confidence", &traffic.confidence.to_string());
    session.set_attribute("classify_protocol_chain", &traffic.protocol_chain);
    session.set_attribute("classify_productivity", &traffic.productivity);
    session.set_attribute("classify_risk", &traffic.risk);
    session.set_attribute("classify_category", &traffic.category);
}

#[async_trait]
impl Plugin for ClassifyPlugin {
    fn name(&self) -> &str {
        "classify"
    }

    fn priority(&self) -> i32 {
        50
    }

    async fn handle(&self, session: &Arc<Session>, message: &PluginMessage, _new_session: bool) -> PluginOutcome {
        let key = ClassifyKey {
            server_addr: message.tuple.server_addr,
            server_port: message.tuple.server_port,
            protocol: message.tuple.protocol,
        };

        let service = self.service.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let traffic = service.classify(key).await;
            if !traffic.is_unknown() {
                attach(&session, &traffic);
            }
        });

        PluginOutcome {
            session_release: true,
            ..PluginOutcome::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Counters;
    use sentry_common::{FiveTuple, Protocol};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    #[tokio::test]
    async fn releases_immediately_regardless_of_upstream_latency() {
        let counters = Arc::new(Counters::new());
        let service = ClassificationService::spawn(
            1,
            crate::classify::UpstreamConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                auth_key: "k".to_string(),
            },
            counters,
            Duration::from_secs(60),
        );
        let plugin = ClassifyPlugin::new(service);

        let tuple = FiveTuple {
            protocol: Protocol::Tcp,
            client_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 1,
            server_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            server_port: 443,
        };
        let table = crate::session::SessionTable::new(Arc::new(Counters::new()));
        let session = table.find_or_create(1, tuple).0;
        let message = PluginMessage {
            ctid: 1,
            tuple,
            payload: Arc::new(vec![]),
        };

        let outcome = tokio::time::timeout(Duration::from_millis(200), plugin.handle(&session, &message, true))
            .await
            .expect("handler must not block on the upstream round trip");
        assert!(outcome.session_release);
    }
}
