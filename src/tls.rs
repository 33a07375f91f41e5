use std::sync::Arc;

use anyhow::{Context, Result};
use log::warn;
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};

#[derive(Clone, Debug, Default)]
pub struct TlsSettings {
    /// Sent as SNI in place of the URL host.
    pub server_name: Option<String>,
    /// Accept whatever certificate the server presents.
    pub skip_certificate_verification: bool,
}

impl TlsSettings {
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let mut config = if self.skip_certificate_verification {
            warn!("TLS certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth()
        } else {
            let root_store =
                RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    pub fn server_name(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .with_context(|| format!("Invalid TLS server name: {name:?}"))
    }
}

/// Trusts every certificate chain. Handshake signatures are still checked,
/// so the peer must hold the key of the certificate it sent.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, TcpStream};

    use super::*;
    use crate::{
        http::{Client, Request},
        test_server::TestServer,
    };

    const OK: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";

    fn client_for(port: u16, skip_certificate_verification: bool) -> Client<impl Fn(&str) -> std::io::Result<TcpStream>> {
        let tls = TlsSettings {
            server_name: Some("bubble.freelink.co.jp".to_string()),
            skip_certificate_verification,
        };
        let target = (IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Client::new(move |_: &str| TcpStream::connect(target), tls).unwrap()
    }

    #[test]
    fn server_name_prefers_override() {
        let settings = TlsSettings {
            server_name: Some("bubble.freelink.co.jp".to_string()),
            skip_certificate_verification: true,
        };
        match settings.server_name("162.159.35.39").unwrap() {
            ServerName::DnsName(name) => assert_eq!(name.as_ref(), "bubble.freelink.co.jp"),
            other => panic!("unexpected server name {other:?}"),
        }

        let settings = TlsSettings::default();
        assert!(matches!(
            settings.server_name("162.159.35.39").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(settings.server_name("not a name!").is_err());
    }

    #[test]
    fn skipping_verification_accepts_self_signed_mismatch() {
        let server = TestServer::spawn("mismatch.invalid", vec![OK]);
        let request = Request::get("https://127.0.0.1/").unwrap();

        let response = client_for(server.port, true).execute(&request).unwrap();
        assert_eq!(response.status_code(), 204);
        assert_eq!(response.read_body().unwrap(), b"");

        let exchanges = server.finish();
        assert_eq!(
            exchanges[0].server_name.as_deref(),
            Some("bubble.freelink.co.jp")
        );
    }

    #[test]
    fn verification_rejects_self_signed_certificate() {
        let server = TestServer::spawn("bubble.freelink.co.jp", vec![OK]);
        let request = Request::get("https://127.0.0.1/").unwrap();

        let error = match client_for(server.port, false).execute(&request) {
            Ok(_) => panic!("self-signed certificate was accepted"),
            Err(error) => error,
        };
        assert!(format!("{error:#}").contains("TLS handshake failed"));

        let exchanges = server.finish();
        assert!(exchanges[0].request_head.is_empty());
    }
}
