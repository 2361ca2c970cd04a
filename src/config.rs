// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Paths, file modes and timeouts shared by the identity components.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

/// Environment variable naming the SPIFFE Workload API socket.
pub const SPIFFE_ENDPOINT_SOCKET: &str = "SPIFFE_ENDPOINT_SOCKET";

/// Socket path used when [`SPIFFE_ENDPOINT_SOCKET`] is not set.
pub const DEFAULT_AGENT_SOCKET: &str = "/run/spire/sockets/agent.sock";

/// How long [`CertManager::run`](crate::CertManager::run) waits for the first identity by default.
pub const DEFAULT_CERT_WAIT_TIMEOUT: Duration = Duration::from_secs(180);

/// Where [`CaBundleManager`](crate::CaBundleManager) persists the first trust bundle by default.
pub const DEFAULT_CA_BUNDLE_PATH: &str = "/tmp/spire-ca-bundle.pem";

/// Task name used when the CA bundle manager enqueues an identity update.
pub const IDENTITY_TASK_NAME: &str = "SPIRE";

/// Mode of written certificate files.
pub const CERT_FILE_MODE: u32 = 0o644;
/// Mode of written private key files.
pub const KEY_FILE_MODE: u32 = 0o600;
/// Mode of written CA bundle files.
pub const BUNDLE_FILE_MODE: u32 = 0o644;

/// Returns the Workload API socket path, honoring [`SPIFFE_ENDPOINT_SOCKET`].
///
/// A `unix:` or `unix://` prefix is preserved so the value can be handed to the
/// workload client as-is.
#[must_use]
pub fn agent_socket_path() -> String {
    env::var(SPIFFE_ENDPOINT_SOCKET)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("unix://{DEFAULT_AGENT_SOCKET}"))
}

/// Where a [`DiskSvidWriter`](crate::DiskSvidWriter) places its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSvidConfig {
    /// Directory holding the certificate, key and bundle. Must already exist.
    pub cert_dir: PathBuf,
    /// File name of the PEM certificate chain.
    pub cert_filename: String,
    /// File name of the PEM private key.
    pub key_filename: String,
    /// File name of the PEM trust bundle.
    pub ca_bundle_filename: String,
}

impl DiskSvidConfig {
    /// Config writing `tls.crt`, `tls.key` and `ca.crt` into `cert_dir`.
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            cert_filename: "tls.crt".to_owned(),
            key_filename: "tls.key".to_owned(),
            ca_bundle_filename: "ca.crt".to_owned(),
        }
    }

    /// Full path of the certificate file.
    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.cert_filename)
    }

    /// Full path of the private key file.
    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(&self.key_filename)
    }

    /// Full path of the CA bundle file.
    #[must_use]
    pub fn ca_bundle_path(&self) -> PathBuf {
        self.cert_dir.join(&self.ca_bundle_filename)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.cert_dir
    }
}
