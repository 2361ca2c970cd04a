// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! mTLS client configuration for connecting to the message broker.
//!
//! The broker's certificate is never checked by the stock webpki verifier with
//! the connection's SNI name. Instead every handshake re-reads the root CA file
//! and verifies the presented chain against the *configured* server name, see
//! [`verify_server_certificate`]. The client certificate is resolved on every
//! handshake as well, so rotations are picked up without rebuilding the config.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        ResolvesClientCert, WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, aws_lc_rs},
    pki_types::{CertificateDer, ServerName, UnixTime},
    sign::CertifiedKey,
};

use crate::ca_bundle::CertificateGetter;
use crate::error::{ConfigError, VerifyError};
use crate::identity;
use crate::prelude::{debug, warn};

/// Credential sourcing for a secure broker connection.
pub trait SecurableConfig: Send + Sync {
    /// Check the configuration before any connection attempt.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] describing what is missing.
    fn validate(&self) -> Result<(), ConfigError>;

    /// Build the TLS 1.3 client configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Tls`] if rustls rejects the configuration.
    fn create_tls_config(&self) -> Result<ClientConfig, ConfigError>;

    /// PEM file holding the roots trusted for the broker.
    fn ca_file(&self) -> &Path;

    /// Name the broker's certificate must be valid for.
    fn server_name(&self) -> &str;
}

/// Client certificate and key read from disk on every handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDiskSecureConfig {
    server_name: String,
    cert_file: PathBuf,
    key_file: PathBuf,
    ca_file: PathBuf,
}

impl OnDiskSecureConfig {
    /// Create a config. Every path must exist and `server_name` must match a
    /// DNS name on the broker's certificate.
    pub fn new(
        server_name: impl Into<String>,
        cert_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        ca_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            cert_file: cert_file.into(),
            key_file: key_file.into(),
            ca_file: ca_file.into(),
        }
    }
}

impl SecurableConfig for OnDiskSecureConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        file_exists("certificate", &self.cert_file)?;
        file_exists("private key", &self.key_file)?;
        file_exists("CA", &self.ca_file)?;
        if self.server_name.is_empty() {
            return Err(ConfigError::NoServerName);
        }
        Ok(())
    }

    fn create_tls_config(&self) -> Result<ClientConfig, ConfigError> {
        client_config(
            &self.ca_file,
            &self.server_name,
            Arc::new(FileCertResolver {
                cert_file: self.cert_file.clone(),
                key_file: self.key_file.clone(),
            }),
        )
    }

    fn ca_file(&self) -> &Path {
        &self.ca_file
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// Client certificate supplied by a [`CertificateGetter`], typically
/// [`CaBundleManager::new_certificate_getter`](crate::CaBundleManager::new_certificate_getter).
#[derive(Clone)]
pub struct InMemorySecureConfig {
    cert_getter: CertificateGetter,
    server_name: String,
    ca_file: PathBuf,
}

impl std::fmt::Debug for InMemorySecureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySecureConfig")
            .field("server_name", &self.server_name)
            .field("ca_file", &self.ca_file)
            .finish_non_exhaustive()
    }
}

impl InMemorySecureConfig {
    /// Create a config trusting the roots in `ca_file`.
    pub fn new(
        server_name: impl Into<String>,
        ca_file: impl Into<PathBuf>,
        cert_getter: CertificateGetter,
    ) -> Self {
        Self {
            cert_getter,
            server_name: server_name.into(),
            ca_file: ca_file.into(),
        }
    }
}

impl SecurableConfig for InMemorySecureConfig {
    /// Invokes the certificate getter once.
    fn validate(&self) -> Result<(), ConfigError> {
        (self.cert_getter)()
            .map(|_| ())
            .map_err(ConfigError::CertificateGetter)
    }

    fn create_tls_config(&self) -> Result<ClientConfig, ConfigError> {
        client_config(
            &self.ca_file,
            &self.server_name,
            Arc::new(GetterCertResolver(Arc::clone(&self.cert_getter))),
        )
    }

    fn ca_file(&self) -> &Path {
        &self.ca_file
    }

    fn server_name(&self) -> &str {
        &self.server_name
    }
}

/// Verify the certificates presented by the broker (leaf first) against the
/// roots in `conf`'s CA file and its configured server name, at the current time.
///
/// # Errors
///
/// [`VerifyError`] naming the first check that failed.
pub fn verify_server_certificate<C>(
    conf: &C,
    certificates: &[CertificateDer<'_>],
) -> Result<(), VerifyError>
where
    C: SecurableConfig + ?Sized,
{
    verify_chain(
        conf.ca_file(),
        conf.server_name(),
        certificates,
        UnixTime::now(),
        &provider(),
    )
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

fn verify_chain(
    ca_file: &Path,
    server_name: &str,
    certificates: &[CertificateDer<'_>],
    now: UnixTime,
    provider: &Arc<CryptoProvider>,
) -> Result<(), VerifyError> {
    let (end_entity, intermediates) = certificates
        .split_first()
        .ok_or(VerifyError::NoCertificate)?;
    for cert in certificates {
        x509_parser::parse_x509_certificate(cert)
            .map_err(|e| VerifyError::Parse(e.to_string()))?;
    }

    let roots = load_roots(ca_file)?;
    let name = ServerName::try_from(server_name.to_owned())
        .map_err(|_| VerifyError::InvalidServerName(server_name.to_owned()))?;
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
        .build()
        .map_err(|e| VerifyError::Chain(rustls::Error::General(e.to_string())))?;
    verifier
        .verify_server_cert(end_entity, intermediates, &name, &[], now)
        .map_err(VerifyError::Chain)?;
    Ok(())
}

fn load_roots(ca_file: &Path) -> Result<RootCertStore, VerifyError> {
    let pem = fs::read(ca_file).map_err(|source| VerifyError::RootLoad {
        path: ca_file.to_path_buf(),
        source,
    })?;
    let certs = identity::parse_certificates(&pem)
        .map_err(|_| VerifyError::RootCertParse(ca_file.to_path_buf()))?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(VerifyError::RootCertParse(ca_file.to_path_buf()));
    }
    if ignored > 0 {
        debug!(path = %ca_file.display(), ignored, "ignored unparsable root certificates");
    }
    Ok(roots)
}

fn file_exists(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    match fs::metadata(path) {
        Err(source) if source.kind() == io::ErrorKind::NotFound => Err(ConfigError::MissingFile {
            what,
            path: path.to_path_buf(),
            source,
        }),
        _ => Ok(()),
    }
}

fn client_config(
    ca_file: &Path,
    server_name: &str,
    resolver: Arc<dyn ResolvesClientCert>,
) -> Result<ClientConfig, ConfigError> {
    let provider = provider();
    let verifier = Arc::new(ConfiguredNameVerifier {
        ca_file: ca_file.to_path_buf(),
        server_name: server_name.to_owned(),
        provider: Arc::clone(&provider),
    });
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_cert_resolver(resolver);
    Ok(config)
}

/// Verifies the broker against the configured name and freshly loaded roots.
#[derive(Debug)]
struct ConfiguredNameVerifier {
    ca_file: PathBuf,
    server_name: String,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ConfiguredNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());

        verify_chain(&self.ca_file, &self.server_name, &chain, now, &self.provider).map_err(
            |err| {
                warn!(
                    error = %err,
                    server_name = %self.server_name,
                    "message bus server certificate rejected"
                );
                rustls::Error::from(err)
            },
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct GetterCertResolver(CertificateGetter);

impl std::fmt::Debug for GetterCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetterCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesClientCert for GetterCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match (self.0)() {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "no client certificate available");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct FileCertResolver {
    cert_file: PathBuf,
    key_file: PathBuf,
}

impl FileCertResolver {
    fn load(&self) -> Result<Arc<CertifiedKey>, String> {
        let cert = fs::read(&self.cert_file)
            .map_err(|e| format!("{}: {e}", self.cert_file.display()))?;
        let key =
            fs::read(&self.key_file).map_err(|e| format!("{}: {e}", self.key_file.display()))?;
        identity::certified_key(&cert, &key).map_err(|e| e.to_string())
    }
}

impl ResolvesClientCert for FileCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        match self.load() {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(error = %err, "failed to load client certificate");
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}
