//! TLS dial helper shared by the certificate cache and the classification
//! service (spec.md §4.5, §4.6).

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::certcache::CertificateData;
use crate::error::CertError;

/// Accepts any certificate chain. The peer is an on-path device whose
/// certificate the daemon cannot validate against a public root store —
/// this is the spec's mandate (spec.md §4.5: "certificate verification
/// disabled because the server may be behind the device"), not an
/// oversight.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth()
}

/// Dials `host:port` over TLS with a 10s connect+handshake deadline,
/// verification disabled per spec, returning the live stream.
pub async fn dial(host: &str, port: u16, deadline: Duration) -> Result<TlsStream<TcpStream>, CertError> {
    let endpoint = format!("{host}:{port}");
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|source| CertError::DialFailed {
            endpoint: endpoint.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| CertError::DialFailed {
            endpoint: endpoint.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
        })?;

    let connector = TlsConnector::from(Arc::new(insecure_client_config()));
    let server_name = ServerName::try_from(host)
        .unwrap_or_else(|_| ServerName::IpAddress(addr.ip()));

    let fut = async {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| CertError::DialFailed {
                endpoint: endpoint.clone(),
                source,
            })?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| CertError::DialFailed {
                endpoint: endpoint.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })
    };

    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CertError::DialTimeout { endpoint }),
    }
}

/// Extracts the peer's leaf certificate and parses the attribute set
/// spec.md §4.5 attaches to a session.
pub fn capture_peer_certificate(stream: &TlsStream<TcpStream>) -> Result<CertificateData, CertError> {
    let (_, conn) = stream.get_ref();
    let certs = conn.peer_certificates().ok_or(CertError::NoCertificate)?;
    let leaf = certs.first().ok_or(CertError::NoCertificate)?;

    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| CertError::ParseFailed(e.to_string()))?;

    let subject = parsed.subject();
    let first = |mut it: x509_parser::x509::X509NameIterator| -> Option<String> {
        it.next().and_then(|attr| attr.as_str().ok()).map(|s| s.to_string())
    };
    // Street address and postal code have no dedicated convenience
    // iterator in x509-parser; address them by arc sequence directly.
    let by_oid = |arcs: &[u64]| -> Option<String> {
        let oid = x509_parser::der_parser::oid::Oid::from(arcs).ok()?;
        subject
            .iter_by_oid(&oid)
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(|s| s.to_string())
    };

    let mut san_dns_names = Vec::new();
    if let Ok(Some(ext)) = parsed.subject_alternative_name() {
        for name in &ext.value.general_names {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                san_dns_names.push(dns.to_string());
            }
        }
    }

    Ok(CertificateData {
        common_name: first(subject.iter_common_name()),
        serial_number: Some(parsed.raw_serial_as_string()),
        country: first(subject.iter_country()),
        organization: first(subject.iter_organization()),
        organizational_unit: first(subject.iter_organizational_unit()),
        locality: first(subject.iter_locality()),
        province: first(subject.iter_state_or_province()),
        street_address: by_oid(&[2, 5, 4, 9]),
        postal_code: by_oid(&[2, 5, 4, 17]),
        san_dns_names,
        der: leaf.as_ref().to_vec(),
    })
}
