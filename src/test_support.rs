// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Throwaway PKI for unit tests.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, string::Ia5String,
};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use spiffe::SpiffeId;

use crate::identity::{TrustBundle, X509Context, X509Identity};

pub(crate) struct Authority {
    issuer: Issuer<'static, KeyPair>,
    cert: rcgen::Certificate,
}

/// Leaf certificate and its PKCS#8 key.
pub(crate) struct Leaf {
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
}

impl Leaf {
    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn key_der(&self) -> PrivatePkcs8KeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key.serialize_der())
    }
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

impl Authority {
    pub fn new(common_name: &str) -> Self {
        let params = ca_params(common_name);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            issuer: Issuer::new(params, key),
            cert,
        }
    }

    /// An intermediate CA signed by this authority.
    pub fn intermediate(&self, common_name: &str) -> Self {
        let params = ca_params(common_name);
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        Self {
            issuer: Issuer::new(params, key),
            cert,
        }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a leaf carrying the given SAN entries.
    pub fn issue(&self, sans: Vec<SanType>) -> Leaf {
        let mut params = CertificateParams::default();
        params.subject_alt_names = sans;
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        Leaf { cert, key }
    }

    pub fn issue_svid(&self, spiffe_id: &str) -> Leaf {
        self.issue(vec![SanType::URI(Ia5String::try_from(spiffe_id).unwrap())])
    }

    pub fn issue_server(&self, dns_name: &str) -> Leaf {
        self.issue(vec![SanType::DnsName(Ia5String::try_from(dns_name).unwrap())])
    }
}

/// A context holding one real SVID for `spiffe_id` and its trust bundle.
pub(crate) fn sample_context(spiffe_id: &str) -> X509Context {
    context_from(&Authority::new("test root"), spiffe_id)
}

pub(crate) fn context_from(authority: &Authority, spiffe_id: &str) -> X509Context {
    let id = SpiffeId::try_from(spiffe_id).unwrap();
    let leaf = authority.issue_svid(spiffe_id);
    let bundle = TrustBundle::new(id.trust_domain().clone(), vec![authority.der()]);
    X509Context::new(
        vec![X509Identity::new(id, vec![leaf.der()], &leaf.key_der())],
        [bundle],
    )
}
