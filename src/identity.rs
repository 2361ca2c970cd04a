// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{collections::HashMap, fmt, sync::Arc};

use pem::{EncodeConfig, LineEnding, Pem};
use rustls::{
    pki_types::{
        CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    },
    sign::CertifiedKey,
};
use spiffe::{SpiffeId, TrustDomain};

use crate::error::IdentityError;

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const PKCS8_KEY_TAG: &str = "PRIVATE KEY";
const SEC1_KEY_TAG: &str = "EC PRIVATE KEY";
const PKCS1_KEY_TAG: &str = "RSA PRIVATE KEY";

/// A workload X509-SVID: leaf-first certificate chain plus its PKCS#8 private key.
#[derive(Clone, PartialEq, Eq)]
pub struct X509Identity {
    spiffe_id: SpiffeId,
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Vec<u8>,
}

impl X509Identity {
    /// Create an identity from its SPIFFE ID, DER chain (leaf first) and PKCS#8 key.
    #[must_use]
    pub fn new(
        spiffe_id: SpiffeId,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: &PrivatePkcs8KeyDer<'_>,
    ) -> Self {
        Self {
            spiffe_id,
            cert_chain,
            private_key: private_key.secret_pkcs8_der().to_vec(),
        }
    }

    /// The identity's SPIFFE ID.
    #[must_use]
    pub const fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Trust domain that issued this identity.
    #[must_use]
    pub fn trust_domain(&self) -> &TrustDomain {
        self.spiffe_id.trust_domain()
    }

    /// The certificate chain, leaf first.
    #[must_use]
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// The leaf certificate.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NoCertificates`] if the chain is empty.
    pub fn leaf(&self) -> Result<&CertificateDer<'static>, IdentityError> {
        self.cert_chain.first().ok_or(IdentityError::NoCertificates)
    }

    /// The private key as a rustls key.
    #[must_use]
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.private_key.clone()))
    }

    /// Marshal the chain and key to PEM, returning `(certificates, key)`.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NoCertificates`] if the chain is empty.
    pub fn marshal(&self) -> Result<(Vec<u8>, Vec<u8>), IdentityError> {
        if self.cert_chain.is_empty() {
            return Err(IdentityError::NoCertificates);
        }
        let certs = encode_pem(CERTIFICATE_TAG, &self.cert_chain);
        let key = encode_pem(PKCS8_KEY_TAG, [&self.private_key]);
        Ok((certs, key))
    }

    /// Decimal serial number of the leaf certificate.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NoCertificates`] if the chain is empty, [`IdentityError::Parse`]
    /// if the leaf is not valid X.509.
    pub fn serial_number(&self) -> Result<String, IdentityError> {
        let leaf = self.leaf()?;
        let (_, cert) = x509_parser::parse_x509_certificate(leaf)
            .map_err(|e| IdentityError::Parse(e.to_string()))?;
        Ok(cert.tbs_certificate.serial.to_string())
    }
}

impl fmt::Debug for X509Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Identity")
            .field("spiffe_id", &self.spiffe_id)
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Trusted authorities for one trust domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    trust_domain: TrustDomain,
    authorities: Vec<CertificateDer<'static>>,
}

impl TrustBundle {
    /// Create a bundle from DER-encoded authorities.
    #[must_use]
    pub const fn new(trust_domain: TrustDomain, authorities: Vec<CertificateDer<'static>>) -> Self {
        Self {
            trust_domain,
            authorities,
        }
    }

    /// The bundle's trust domain.
    #[must_use]
    pub const fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The DER-encoded authorities.
    #[must_use]
    pub fn authorities(&self) -> &[CertificateDer<'static>] {
        &self.authorities
    }

    /// Marshal every authority to concatenated PEM.
    ///
    /// # Errors
    ///
    /// [`IdentityError::EmptyBundle`] if there is nothing to marshal.
    pub fn marshal(&self) -> Result<Vec<u8>, IdentityError> {
        if self.authorities.is_empty() {
            return Err(IdentityError::EmptyBundle(self.trust_domain.to_string()));
        }
        Ok(encode_pem(CERTIFICATE_TAG, &self.authorities))
    }
}

/// Snapshot of the workload's identities and trust bundles.
///
/// Always replaced as a whole; nothing is ever merged across snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct X509Context {
    identities: Vec<X509Identity>,
    bundles: HashMap<TrustDomain, TrustBundle>,
}

impl X509Context {
    /// Create a context. The first identity is the default one.
    pub fn new(
        identities: Vec<X509Identity>,
        bundles: impl IntoIterator<Item = TrustBundle>,
    ) -> Self {
        Self {
            identities,
            bundles: bundles
                .into_iter()
                .map(|bundle| (bundle.trust_domain.clone(), bundle))
                .collect(),
        }
    }

    /// All identities, default first.
    #[must_use]
    pub fn identities(&self) -> &[X509Identity] {
        &self.identities
    }

    /// The default identity.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NoIdentity`] if the context is empty.
    pub fn default_identity(&self) -> Result<&X509Identity, IdentityError> {
        self.identities.first().ok_or(IdentityError::NoIdentity)
    }

    /// The bundle for `trust_domain`, if any.
    #[must_use]
    pub fn bundle(&self, trust_domain: &TrustDomain) -> Option<&TrustBundle> {
        self.bundles.get(trust_domain)
    }

    /// The bundle for the default identity's trust domain.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NoIdentity`] or [`IdentityError::NoBundle`].
    pub fn bundle_for_default(&self) -> Result<&TrustBundle, IdentityError> {
        let trust_domain = self.default_identity()?.trust_domain();
        self.bundle(trust_domain)
            .ok_or_else(|| IdentityError::NoBundle(trust_domain.to_string()))
    }
}

impl X509Context {
    /// Convert a Workload API context, copying the bundles of every identity's
    /// trust domain and of each domain in `federates_with`.
    ///
    /// The Workload API bundle set can only be queried by trust domain, so
    /// federated bundles are copied only when their domain is listed here.
    #[must_use]
    pub fn from_workload_api(
        context: &spiffe::X509Context,
        federates_with: &[TrustDomain],
    ) -> Self {
        let identities: Vec<X509Identity> = context
            .svids()
            .iter()
            .map(|svid| X509Identity {
                spiffe_id: svid.spiffe_id().clone(),
                cert_chain: svid
                    .cert_chain()
                    .iter()
                    .map(|c| CertificateDer::from(c.content().to_owned()))
                    .collect(),
                private_key: svid.private_key().content().to_owned(),
            })
            .collect();

        let mut bundles = HashMap::new();
        let trust_domains = identities
            .iter()
            .map(X509Identity::trust_domain)
            .chain(federates_with);
        for trust_domain in trust_domains {
            if bundles.contains_key(trust_domain) {
                continue;
            }
            if let Some(bundle) = context.bundle_set().get_bundle(trust_domain) {
                let authorities = bundle
                    .authorities()
                    .iter()
                    .map(|authority| CertificateDer::from(authority.content().to_owned()))
                    .collect();
                bundles.insert(
                    trust_domain.clone(),
                    TrustBundle::new(trust_domain.clone(), authorities),
                );
            }
        }

        Self {
            identities,
            bundles,
        }
    }
}

impl From<&spiffe::X509Context> for X509Context {
    fn from(context: &spiffe::X509Context) -> Self {
        Self::from_workload_api(context, &[])
    }
}

fn encode_pem<I, B>(tag: &str, blocks: I) -> Vec<u8>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
    blocks
        .into_iter()
        .map(|der| pem::encode_config(&Pem::new(tag, der.as_ref().to_vec()), config))
        .collect::<String>()
        .into_bytes()
}

/// Decode every `CERTIFICATE` block in `pem_bytes`.
pub(crate) fn parse_certificates(
    pem_bytes: &[u8],
) -> Result<Vec<CertificateDer<'static>>, IdentityError> {
    let certs: Vec<_> = pem::parse_many(pem_bytes)?
        .into_iter()
        .filter(|block| block.tag() == CERTIFICATE_TAG)
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(IdentityError::MissingPemBlock("certificate"));
    }
    Ok(certs)
}

/// Decode the first private key block in `pem_bytes`.
pub(crate) fn parse_private_key(pem_bytes: &[u8]) -> Result<PrivateKeyDer<'static>, IdentityError> {
    pem::parse_many(pem_bytes)?
        .into_iter()
        .find_map(|block| match block.tag() {
            PKCS8_KEY_TAG => Some(PrivatePkcs8KeyDer::from(block.into_contents()).into()),
            SEC1_KEY_TAG => Some(PrivateSec1KeyDer::from(block.into_contents()).into()),
            PKCS1_KEY_TAG => Some(PrivatePkcs1KeyDer::from(block.into_contents()).into()),
            _ => None,
        })
        .ok_or(IdentityError::MissingPemBlock("private key"))
}

/// Pair a PEM chain and PEM key into a rustls signing identity.
pub(crate) fn certified_key(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<CertifiedKey>, IdentityError> {
    let chain = parse_certificates(cert_pem)?;
    let key = parse_private_key(key_pem)?;
    let signing_key =
        rustls::crypto::aws_lc_rs::sign::any_supported_type(&key).map_err(IdentityError::KeyPair)?;
    let certified = CertifiedKey::new(chain, signing_key);
    match certified.keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
        Err(err) => return Err(IdentityError::KeyPair(err)),
    }
    Ok(Arc::new(certified))
}
