use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

/// TLS options read from the configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM bundle of trusted certificates used when verifying the other side.
    pub ca_cert_path: Option<PathBuf>,
    pub verify_peer: bool,
    /// Present our own certificate (always done when acting as the server).
    pub use_cert: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("sdispatch");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("sdispatch");
    }
    PathBuf::from(".sdispatch")
}

impl TlsSettings {
    fn identity_paths(&self) -> (PathBuf, PathBuf) {
        let dir = config_dir();
        (
            self.cert_path.clone().unwrap_or_else(|| dir.join("cert.pem")),
            self.key_path.clone().unwrap_or_else(|| dir.join("key.pem")),
        )
    }
}

fn ensure_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    if cert_path.exists() && key_path.exists() {
        return Ok(());
    }
    for dir in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let mut names = vec!["localhost".to_string()];
    if let Ok(host) = hostname::get() {
        let host = host.to_string_lossy().into_owned();
        if !host.is_empty() && host != "localhost" {
            names.push(host);
        }
    }
    let cert = rcgen::generate_simple_self_signed(names).context("generate self-signed cert")?;
    fs::write(cert_path, cert.serialize_pem().context("serialize cert")?).context("write cert pem")?;
    fs::write(key_path, cert.serialize_private_key_pem()).context("write key pem")?;
    Ok(())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open certificate {}", path.display()))?,
    );
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.context("read certificate")?);
    }
    if out.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
    }
    Ok(out)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let open = || -> Result<BufReader<fs::File>> {
        Ok(BufReader::new(
            fs::File::open(path).with_context(|| format!("open key {}", path.display()))?,
        ))
    };
    if let Some(k) = rustls_pemfile::pkcs8_private_keys(&mut open()?).next() {
        return Ok(PrivateKeyDer::from(k.context("pkcs8 key")?));
    }
    let k = rustls_pemfile::rsa_private_keys(&mut open()?)
        .next()
        .with_context(|| format!("no private key in {}", path.display()))??;
    Ok(PrivateKeyDer::from(k))
}

fn load_roots(settings: &TlsSettings) -> Result<RootCertStore> {
    let path = settings
        .ca_cert_path
        .as_ref()
        .context("peer verification requires ca_cert_path")?;
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(load_certs(path)?);
    if added == 0 {
        return Err(anyhow!("no usable CA certificates in {}", path.display()));
    }
    Ok(roots)
}

pub fn client_config(settings: &TlsSettings) -> Result<Arc<rustls::ClientConfig>> {
    let builder = if settings.verify_peer {
        rustls::ClientConfig::builder().with_root_certificates(load_roots(settings)?)
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    };
    let cfg = if settings.use_cert {
        let (cert_path, key_path) = settings.identity_paths();
        ensure_self_signed(&cert_path, &key_path)?;
        builder
            .with_client_auth_cert(load_certs(&cert_path)?, load_key(&key_path)?)
            .context("build client tls config")?
    } else {
        builder.with_no_client_auth()
    };
    Ok(Arc::new(cfg))
}

pub fn server_config(settings: &TlsSettings) -> Result<Arc<rustls::ServerConfig>> {
    let (cert_path, key_path) = settings.identity_paths();
    ensure_self_signed(&cert_path, &key_path)?;
    let certs = load_certs(&cert_path)?;
    let key = load_key(&key_path)?;

    let builder = if settings.verify_peer {
        let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(settings)?))
            .build()
            .context("build client verifier")?;
        rustls::ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        rustls::ServerConfig::builder().with_no_client_auth()
    };
    let cfg = builder
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(Arc::new(cfg))
}

/// Used when peer verification is switched off.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|e| anyhow!("invalid server name {}: {}", host, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use tempfile::TempDir;

    fn identity(dir: &TempDir) -> TlsSettings {
        TlsSettings {
            cert_path: Some(dir.path().join("c/cert.pem")),
            key_path: Some(dir.path().join("c/key.pem")),
            ..Default::default()
        }
    }

    #[test]
    fn server_config_generates_missing_identity() {
        let dir = TempDir::new().unwrap();
        let settings = identity(&dir);
        server_config(&settings).unwrap();
        assert!(dir.path().join("c/cert.pem").exists());
        assert!(dir.path().join("c/key.pem").exists());

        // Second call reuses the files on disk
        let before = fs::read(dir.path().join("c/cert.pem")).unwrap();
        server_config(&settings).unwrap();
        assert_eq!(before, fs::read(dir.path().join("c/cert.pem")).unwrap());
    }

    #[test]
    fn verification_without_trust_store_is_an_error() {
        let settings = TlsSettings { verify_peer: true, ..Default::default() };
        assert!(client_config(&settings).is_err());
    }

    #[test]
    fn server_names() {
        assert!(matches!(server_name_for("127.0.0.1").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("[::1]").unwrap(), ServerName::IpAddress(_)));
        assert!(matches!(server_name_for("peer.example").unwrap(), ServerName::DnsName(_)));
    }

    #[test]
    fn unverified_loopback_handshake() {
        let dir = TempDir::new().unwrap();
        let server_cfg = server_config(&identity(&dir)).unwrap();
        let client_cfg = client_config(&TlsSettings::default()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = std::thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            let conn = rustls::ServerConnection::new(server_cfg).unwrap();
            let mut tls = rustls::StreamOwned::new(conn, sock);
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).unwrap();
            buf
        });

        let sock = TcpStream::connect(addr).unwrap();
        let conn = rustls::ClientConnection::new(client_cfg, server_name_for("127.0.0.1").unwrap()).unwrap();
        let mut tls = rustls::StreamOwned::new(conn, sock);
        tls.write_all(b"hello").unwrap();
        tls.flush().unwrap();
        assert_eq!(&srv.join().unwrap(), b"hello");
    }
}
