// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Error types for every component of the crate.
//!
//! * [`ConfigError`]: invalid secure configuration, detected before touching the network.
//! * [`FetchError`] / [`WatchError`]: the identity agent stream failed.
//! * [`ManagerError`]: what ends [`CertManager::run`](crate::CertManager::run) or is
//!   forwarded on its error channel, including the startup timeout.
//! * [`IdentityError`] / [`WriteError`]: PEM conversion and disk writes.
//! * [`VerifyError`]: the message bus server failed manual chain verification.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Boxed error used at seams supplied by callers (reload hooks, task sync functions).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure extracting or converting material from an [`X509Context`](crate::X509Context).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// The context carries no identity at all.
    #[error("x509 context has no identities")]
    NoIdentity,
    /// The default identity has an empty certificate chain.
    #[error("no certificates in svid response")]
    NoCertificates,
    /// The context has no trust bundle for the default identity's trust domain.
    #[error("error parsing CA bundle from svid response: no bundle for trust domain {0}")]
    NoBundle(String),
    /// The trust bundle has no authorities to marshal.
    #[error("trust bundle for {0} has no authorities")]
    EmptyBundle(String),
    /// PEM data could not be decoded.
    #[error("invalid PEM data: {0}")]
    InvalidPem(#[from] pem::PemError),
    /// PEM data did not contain a block of the expected kind.
    #[error("no {0} found in PEM data")]
    MissingPemBlock(&'static str),
    /// A certificate could not be parsed as X.509.
    #[error("failed to parse certificate: {0}")]
    Parse(String),
    /// The certificate and key could not be paired into a TLS identity.
    #[error("failed to pair certificate and key: {0}")]
    KeyPair(#[source] rustls::Error),
}

/// Artifact written by an SVID writer, used to name the failing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// PEM certificate chain.
    Certificate,
    /// PEM private key.
    PrivateKey,
    /// PEM trust bundle.
    CaBundle,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Certificate => "certificate",
            Self::PrivateKey => "private key",
            Self::CaBundle => "CA bundle",
        })
    }
}

/// Failure applying an identity snapshot through an [`SvidWriter`](crate::SvidWriter).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WriteError {
    /// The default identity could not be marshaled to PEM.
    #[error("unable to marshal X.509 SVID: {0}")]
    MarshalSvid(#[source] IdentityError),
    /// The trust bundle could not be marshaled to PEM.
    #[error("unable to marshal X.509 SVID bundle: {0}")]
    MarshalBundle(#[source] IdentityError),
    /// Writing one of the artifacts failed.
    #[error("error writing {artifact} to {path}: {source}")]
    Io {
        /// Which artifact failed.
        artifact: Artifact,
        /// Target path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The blocking write task panicked or was canceled.
    #[error("SVID write task did not complete: {0}")]
    Interrupted(String),
    /// The configured certificate directory is missing.
    #[error("certificate directory {path} does not exist: {source}")]
    MissingDir {
        /// Directory that was checked.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Classification of a Workload API watch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorKind {
    /// The agent could not be reached.
    Unavailable,
    /// The agent refused to issue an identity (yet).
    PermissionDenied,
    /// The watch was canceled by the caller.
    Canceled,
    /// Any other failure.
    Other,
}

impl fmt::Display for WatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unavailable => "workload API unavailable",
            Self::PermissionDenied => "permission denied",
            Self::Canceled => "canceled",
            Self::Other => "workload API error",
        })
    }
}

/// Terminal failure of an X509 context watch.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct WatchError {
    kind: WatchErrorKind,
    message: String,
}

impl WatchError {
    /// Create a watch error of the given kind.
    pub fn new(kind: WatchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error's classification.
    #[must_use]
    pub const fn kind(&self) -> WatchErrorKind {
        self.kind
    }

    /// Whether the watch ended because it was canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.kind == WatchErrorKind::Canceled
    }

    /// Remediation hint logged alongside the error.
    #[must_use]
    pub const fn guidance(&self) -> &'static str {
        match self.kind {
            WatchErrorKind::Unavailable => "cannot connect to the SPIRE agent",
            WatchErrorKind::PermissionDenied => "still waiting for certificates",
            WatchErrorKind::Canceled => "watch canceled",
            WatchErrorKind::Other => "unexpected X509 watch error",
        }
    }
}

/// Failure starting or stopping a [`CertFetcher`](crate::CertFetcher).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The fetcher has no Workload API client, either never had one or was stopped.
    #[error("failed to start cert fetcher: no workload API client")]
    NoClient,
    /// Connecting to the Workload API failed.
    #[error("failed to connect to the workload API at {path}: {message}")]
    Connect {
        /// Socket path used.
        path: String,
        /// Client error message.
        message: String,
    },
    /// The watch itself failed.
    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Errors produced by a [`CertManager`](crate::CertManager).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    /// The fetcher could not be started.
    #[error("error starting cert fetcher: {0}")]
    StartFetcher(#[source] FetchError),
    /// The fetcher failed before the first identity arrived.
    #[error("error waiting for initial trust bundle: {0}")]
    InitialBundle(#[source] WatchError),
    /// Applying an identity failed.
    #[error("error writing certificates: {0}")]
    Write(#[source] WriteError),
    /// No identity arrived within the startup window.
    #[error("timed out waiting for trust bundle")]
    Timeout,
    /// The cancellation token fired.
    #[error("cert manager canceled")]
    Canceled,
    /// The reload hook failed.
    #[error("error reloading after certificate update: {0}")]
    Reload(#[source] BoxError),
    /// The identity stream failed after startup.
    #[error("identity stream failed: {0}")]
    Stream(#[source] WatchError),
    /// The fetcher closed its channels without reporting an error.
    #[error("identity stream closed")]
    StreamClosed,
}

/// Invalid secure message bus configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A configured file does not exist.
    #[error("{what} file {path} does not exist: {source}")]
    MissingFile {
        /// Role of the file.
        what: &'static str,
        /// Configured path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// No server name was configured.
    #[error("no server name provided")]
    NoServerName,
    /// The in-memory certificate getter could not produce a certificate.
    #[error("certificate getter failed: {0}")]
    CertificateGetter(#[source] IdentityError),
    /// Two connect options contradict each other.
    #[error("conflicting message bus option: {0}")]
    ConflictingOption(String),
    /// The TLS configuration could not be built.
    #[error("failed to create TLS config: {0}")]
    Tls(#[from] rustls::Error),
}

/// Message bus failures.
#[cfg(feature = "message-bus")]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// Publish, subscribe or close was called without a connection.
    #[error("no nats connection found")]
    NoConnection,
    /// The secure configuration is invalid.
    #[error("invalid secure NATS configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// Connecting to the broker failed.
    #[error("could not connect to NATS server: {0}")]
    Connect(#[source] async_nats::ConnectError),
    /// Publishing failed.
    #[error("failed to publish to {subject}: {source}")]
    Publish {
        /// Target subject.
        subject: String,
        /// Client error.
        #[source]
        source: async_nats::PublishError,
    },
    /// Subscribing failed.
    #[error("failed to subscribe to {subject}: {source}")]
    Subscribe {
        /// Target subject.
        subject: String,
        /// Client error.
        #[source]
        source: async_nats::SubscribeError,
    },
    /// A handler is already registered for the subject.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),
    /// Flushing the connection on close failed.
    #[error("failed to close NATS connection: {0}")]
    Close(#[source] BoxError),
}

/// Manual verification of the broker's certificate chain failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VerifyError {
    /// The server presented no certificate.
    #[error("server did not present a certificate")]
    NoCertificate,
    /// A presented certificate is not valid X.509.
    #[error("tls: failed to parse certificate from server: {0}")]
    Parse(String),
    /// The root CA file could not be read.
    #[error("could not load or parse rootCA file {path}: {source}")]
    RootLoad {
        /// Root CA file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The root CA file held no usable certificate.
    #[error("could not parse root certificate from {0}")]
    RootCertParse(PathBuf),
    /// The configured server name is not a valid DNS name or IP address.
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    /// Chain building or name validation failed.
    #[error("certificate verification failed: {0}")]
    Chain(#[source] rustls::Error),
}

impl From<VerifyError> for rustls::Error {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Chain(inner) => inner,
            other => Self::General(other.to_string()),
        }
    }
}
