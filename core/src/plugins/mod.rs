//! Built-in plugins (SPEC_FULL.md §2.13).
//!
//! Reference implementations of the pipeline subscribers named in
//! spec.md §4.3's examples. They ground the otherwise-abstract pipeline
//! contract in real behavior; a deployment is free to register
//! additional third-party plugins alongside or instead of these.

pub mod certfetch;
pub mod classify_plugin;
pub mod dns;
pub mod geoip;
pub mod threat;

pub use certfetch::CertFetchPlugin;
pub use classify_plugin::ClassifyPlugin;
pub use dns::DnsPlugin;
pub use geoip::GeoIpPlugin;
pub use threat::{ThreatPlugin, DEFAULT_THREAT_SENSITIVITY};
