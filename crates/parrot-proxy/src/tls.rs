//! TLS termination and upstream TLS for record mode.
//!
//! The proxy is a deliberate man-in-the-middle: client-side connections are
//! terminated with a per-SNI leaf certificate minted from a session CA
//! (which the app under test must trust), and the upstream leg skips
//! verification — fidelity of capture, not trust, is the point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, LazyConfigAcceptor, TlsConnector};
use tracing::debug;

pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    leaf_cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
    upstream: TlsConnector,
}

impl CertAuthority {
    /// Load CA material from disk when both paths are given (generating and
    /// persisting on first use), otherwise run with an ephemeral CA.
    pub fn load_or_generate(
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let (issuer, ca_cert_der) = match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) if cert_path.exists() && key_path.exists() => {
                let cert_pem = std::fs::read_to_string(cert_path)
                    .with_context(|| format!("read CA cert {}", cert_path.display()))?;
                let key_pem = std::fs::read_to_string(key_path)
                    .with_context(|| format!("read CA key {}", key_path.display()))?;
                let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
                    .context("parse CA certificate PEM")?;
                let key = KeyPair::from_pem(&key_pem).context("parse CA key PEM")?;
                let issuer = Issuer::from_ca_cert_der(&cert_der, key)
                    .context("reconstruct issuer from CA certificate")?;
                (issuer, cert_der)
            }
            (cert_path, key_path) => {
                let key = KeyPair::generate().context("generate CA key")?;
                let params = ca_params();
                let cert = params
                    .self_signed(&key)
                    .context("self-sign CA certificate")?;
                let cert_der = cert.der().clone();
                if let (Some(cert_path), Some(key_path)) = (cert_path, key_path) {
                    std::fs::write(cert_path, cert.pem())?;
                    std::fs::write(key_path, key.serialize_pem())?;
                    debug!(path = %cert_path.display(), "persisted generated CA");
                }
                (Issuer::new(params, key), cert_der)
            }
        };

        let upstream_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureUpstreamVerifier))
            .with_no_client_auth();

        Ok(Self {
            issuer,
            ca_cert_der,
            leaf_cache: Mutex::new(HashMap::new()),
            upstream: TlsConnector::from(Arc::new(upstream_config)),
        })
    }

    /// Accept the client's handshake, answering with a certificate for
    /// whatever name the ClientHello asked for. Returns the SNI host.
    pub async fn terminate<S>(
        &self,
        stream: S,
    ) -> anyhow::Result<(server::TlsStream<S>, Option<String>)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = acceptor.await.context("read ClientHello")?;
        let sni = start
            .client_hello()
            .server_name()
            .map(|name| name.to_string());
        let host = sni.clone().unwrap_or_else(|| "localhost".to_string());
        let config = self.server_config_for(&host)?;
        let tls = start
            .into_stream(config)
            .await
            .context("client TLS handshake")?;
        Ok((tls, sni))
    }

    /// TLS to the real destination, speaking the hostname the client asked
    /// for so SNI-routed services answer correctly.
    pub async fn connect_upstream(
        &self,
        dest: SocketAddr,
        host: &str,
    ) -> anyhow::Result<client::TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(dest)
            .await
            .with_context(|| format!("dial upstream {dest}"))?;
        let server_name = ServerName::try_from(host.to_string())
            .or_else(|_| ServerName::try_from(dest.ip().to_string()))
            .context("derive TLS server name")?;
        let tls = self
            .upstream
            .connect(server_name, tcp)
            .await
            .context("upstream TLS handshake")?;
        Ok(tls)
    }

    /// Upgrade an already-established upstream stream to TLS (MySQL's
    /// in-band SSL upgrade happens mid-connection, after the greeting).
    pub async fn upgrade_upstream<S>(
        &self,
        stream: S,
        host: &str,
    ) -> anyhow::Result<client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(host.to_string())
            .context("derive TLS server name for upgrade")?;
        let tls = self
            .upstream
            .connect(server_name, stream)
            .await
            .context("upstream TLS upgrade")?;
        Ok(tls)
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    fn server_config_for(&self, host: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let key = host.to_ascii_lowercase();
        if let Some(config) = self
            .leaf_cache
            .lock()
            .expect("leaf cache poisoned")
            .get(&key)
        {
            return Ok(Arc::clone(config));
        }

        let leaf_key = KeyPair::generate().context("generate leaf key")?;
        let leaf_params = leaf_params(host)?;
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &self.issuer)
            .context("sign leaf certificate")?;

        let chain = vec![leaf_cert.der().clone(), self.ca_cert_der.clone()];
        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, private_key)
            .context("build server config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = Arc::new(config);

        self.leaf_cache
            .lock()
            .expect("leaf cache poisoned")
            .insert(key, Arc::clone(&config));
        Ok(config)
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "parrot proxy CA");
    dn.push(DnType::OrganizationName, "parrot");
    params.distinguished_name = dn;
    params
}

fn leaf_params(host: &str) -> anyhow::Result<CertificateParams> {
    let mut params =
        CertificateParams::new(Vec::<String>::new()).context("new leaf params")?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(
            SanType::DnsName(host.try_into().context("host as DNS name")?),
        );
    }
    Ok(params)
}

/// Record mode dials whatever the app dialed; the proxy is not in the
/// business of judging the dependency's certificate.
#[derive(Debug)]
struct InsecureUpstreamVerifier;

impl ServerCertVerifier for InsecureUpstreamVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_configs_are_cached_per_host() {
        let ca = CertAuthority::load_or_generate(None, None).unwrap();
        let a = ca.server_config_for("svc.internal").unwrap();
        let b = ca.server_config_for("SVC.internal").unwrap();
        let c = ca.server_config_for("other.internal").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn ip_hosts_get_ip_sans() {
        assert!(leaf_params("10.0.0.1").is_ok());
        assert!(leaf_params("db.internal").is_ok());
    }

    #[test]
    fn ca_material_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca.key");

        let first =
            CertAuthority::load_or_generate(Some(&cert_path), Some(&key_path)).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());

        let second =
            CertAuthority::load_or_generate(Some(&cert_path), Some(&key_path)).unwrap();
        assert_eq!(first.ca_cert_der(), second.ca_cert_der());
    }

    #[tokio::test]
    async fn terminate_speaks_tls_to_a_real_client() {
        let ca = Arc::new(CertAuthority::load_or_generate(None, None).unwrap());

        // Client config trusting the session CA.
        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca.ca_cert_der().clone()).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = {
            let ca = Arc::clone(&ca);
            tokio::spawn(async move {
                let (mut tls, sni) = ca.terminate(server_io).await.unwrap();
                assert_eq!(sni.as_deref(), Some("svc.internal"));
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut buf = [0u8; 4];
                tls.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");
                tls.write_all(b"pong").await.unwrap();
                tls.flush().await.unwrap();
            })
        };

        let name = ServerName::try_from("svc.internal").unwrap();
        let mut tls = connector.connect(name, client_io).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        server.await.unwrap();
    }
}
