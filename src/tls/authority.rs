//! MITM certificate authority.
//!
//! A persistent root CA (generated on first start, PEM on disk) signs
//! per-host leaf certificates on demand. Leafs are cached for the process
//! lifetime; the SNI resolver looks them up during the TLS handshake and
//! falls back to the CONNECT target host when the client sends no SNI.

use anyhow::{Context, Result};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_KEY_FILE: &str = "ca-key.pem";
const CA_COMMON_NAME: &str = "Periscope Proxy Root CA";

pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    cache: DashMap<String, Arc<CertifiedKey>>,
    /// Last issued serial; serials are current-time-ms bumped to stay
    /// monotonic-unique within the process.
    last_serial: AtomicU64,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never dump key material into logs.
        f.debug_struct("CertificateAuthority")
            .field("cached_hosts", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load the root CA from `certs_dir`, generating and persisting a new
    /// one when absent.
    pub fn load_or_create(certs_dir: &Path) -> Result<Self> {
        let cert_path = certs_dir.join(CA_CERT_FILE);
        let key_path = certs_dir.join(CA_KEY_FILE);

        let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)
                .with_context(|| format!("failed to read {}", cert_path.display()))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .with_context(|| format!("failed to read {}", key_path.display()))?;
            info!("tls: loaded root CA, path={}", cert_path.display());
            (cert_pem, key_pem)
        } else {
            std::fs::create_dir_all(certs_dir)
                .with_context(|| format!("failed to create {}", certs_dir.display()))?;
            let (cert_pem, key_pem) = generate_root_ca()?;
            std::fs::write(&cert_path, &cert_pem)
                .with_context(|| format!("failed to write {}", cert_path.display()))?;
            write_private(&key_path, &key_pem)
                .with_context(|| format!("failed to write {}", key_path.display()))?;
            info!("tls: generated root CA, path={}", cert_path.display());
            (cert_pem, key_pem)
        };

        let ca_key = KeyPair::from_pem(&key_pem).context("failed to parse CA key")?;
        // Re-sign the recovered params with the same key so rcgen can use
        // the CA as an issuer; clients keep trusting the on-disk PEM.
        let ca_cert = CertificateParams::from_ca_cert_pem(&cert_pem)
            .context("failed to parse CA cert")?
            .self_signed(&ca_key)
            .context("failed to rebuild CA signer")?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem: cert_pem,
            cache: DashMap::new(),
            last_serial: AtomicU64::new(0),
        })
    }

    /// The root certificate PEM — what users install into their trust store.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn cached_host_count(&self) -> usize {
        self.cache.len()
    }

    /// Look up or issue the leaf certificate for `host`. Issuance is
    /// single-writer-per-host via the cache entry lock.
    pub fn certified_key_for(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(existing) = self.cache.get(host) {
            return Ok(existing.clone());
        }

        match self.cache.entry(host.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let key = self.issue_leaf(host)?;
                metrics::counter!("proxy_certificates_issued_total").increment(1);
                debug!("tls: issued leaf certificate, host={}", host);
                Ok(e.insert(Arc::new(key)).clone())
            }
        }
    }

    /// Build a rustls server config that answers with the leaf for the
    /// SNI-requested name, falling back to the CONNECT target host.
    pub fn server_config_for_host(
        self: &Arc<Self>,
        fallback_host: &str,
    ) -> Result<Arc<rustls::ServerConfig>> {
        // Pre-issue the fallback so a missing SNI cannot fail mid-handshake.
        self.certified_key_for(fallback_host)?;

        let resolver = SniResolver {
            authority: self.clone(),
            fallback_host: fallback_host.to_string(),
        };
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    fn issue_leaf(&self, host: &str) -> Result<CertifiedKey> {
        let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
            let mut params = CertificateParams::new(Vec::<String>::new())
                .context("failed to create cert params")?;
            params.subject_alt_names.push(SanType::IpAddress(ip));
            params
        } else {
            CertificateParams::new(vec![host.to_string(), format!("*.{}", host)])
                .context("failed to create cert params")?
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.serial_number = Some(SerialNumber::from(self.next_serial()));
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(365);

        let key_pair = KeyPair::generate().context("failed to generate leaf key")?;
        let cert = params
            .signed_by(&key_pair, &self.ca_cert, &self.ca_key)
            .context("failed to sign leaf cert")?;

        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let signing_key = any_supported_type(&PrivateKeyDer::Pkcs8(key_der))
            .map_err(|e| anyhow::anyhow!("unusable leaf key: {}", e))?;
        Ok(CertifiedKey::new(
            vec![CertificateDer::from(cert.der().to_vec())],
            signing_key,
        ))
    }

    fn next_serial(&self) -> u64 {
        let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        self.last_serial
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .map(|last| now_ms.max(last + 1))
            .unwrap_or(now_ms)
    }
}

fn generate_root_ca() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::ContentCommitment,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::CodeSigning,
        ExtendedKeyUsagePurpose::EmailProtection,
        ExtendedKeyUsagePurpose::TimeStamping,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate().context("failed to generate CA key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign CA cert")?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

/// Resolves the handshake certificate from the SNI name, or the CONNECT
/// target when the client sends none.
#[derive(Debug)]
struct SniResolver {
    authority: Arc<CertificateAuthority>,
    fallback_host: String,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| self.fallback_host.clone());
        match self.authority.certified_key_for(&host) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!("tls: leaf issuance failed, host={}, error={}", host, e);
                None
            }
        }
    }
}
