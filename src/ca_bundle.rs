// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};

use crate::config::{BUNDLE_FILE_MODE, DEFAULT_CA_BUNDLE_PATH, IDENTITY_TASK_NAME};
use crate::error::{Artifact, IdentityError, ManagerError, WriteError};
use crate::identity::{self, X509Context};
use crate::prelude::{debug, info};
use crate::task_queue::TaskQueue;
use crate::writer::{SvidWriter, write_file};

/// Callback returning the current client certificate, invoked on every TLS handshake.
pub type CertificateGetter =
    Arc<dyn Fn() -> Result<Arc<CertifiedKey>, IdentityError> + Send + Sync>;

#[derive(Default)]
struct State {
    last_hash: Option<[u8; 32]>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

/// Holds the live certificate and key in memory and fans identity updates out
/// through a [`TaskQueue`].
///
/// The first snapshot written persists its trust bundle to a fixed path and
/// captures the certificate and key. Every snapshot, including the first, is
/// enqueued under the task name [`IDENTITY_TASK_NAME`]; the queue's consumer
/// decides whether the bundle changed ([`CaBundleManager::ca_bundle_bytes`])
/// and rotates the in-memory pair ([`CaBundleManager::cert_key_bytes`]).
pub struct CaBundleManager {
    state: Arc<RwLock<State>>,
    queue: TaskQueue<Arc<X509Context>>,
    bundle_path: PathBuf,
}

impl std::fmt::Debug for CaBundleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaBundleManager")
            .field("bundle_path", &self.bundle_path)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl CaBundleManager {
    /// Create a manager persisting the first bundle to [`DEFAULT_CA_BUNDLE_PATH`].
    #[must_use]
    pub fn new(queue: TaskQueue<Arc<X509Context>>) -> Self {
        Self::with_bundle_path(queue, DEFAULT_CA_BUNDLE_PATH)
    }

    /// Create a manager persisting the first bundle to `bundle_path`.
    pub fn with_bundle_path(
        queue: TaskQueue<Arc<X509Context>>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            state: Arc::default(),
            queue,
            bundle_path: bundle_path.into(),
        }
    }

    /// Where the first trust bundle is persisted.
    #[must_use]
    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    /// Record the SHA-256 of `bundle` and report whether it differs from the
    /// previously recorded one.
    pub fn test_and_update_ca_bundle(&self, bundle: &[u8]) -> bool {
        let hash: [u8; 32] = Sha256::digest(bundle).into();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.last_hash == Some(hash) {
            return false;
        }
        state.last_hash = Some(hash);
        debug!("CA bundle hash changed");
        true
    }

    /// PEM trust bundle of the default identity's trust domain, and whether it
    /// changed since the last call.
    ///
    /// # Errors
    ///
    /// [`IdentityError`] if the context has no default identity or bundle.
    pub fn ca_bundle_bytes(&self, context: &X509Context) -> Result<(Vec<u8>, bool), IdentityError> {
        let bundle = context.bundle_for_default()?.marshal()?;
        let changed = self.test_and_update_ca_bundle(&bundle);
        Ok((bundle, changed))
    }

    /// Decimal serial number of the default identity's leaf certificate.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NoCertificates`] when the chain is empty.
    pub fn serial_number(context: &X509Context) -> Result<String, IdentityError> {
        context.default_identity()?.serial_number()
    }

    /// Replace the in-memory certificate and key with the default identity of `context`.
    ///
    /// # Errors
    ///
    /// [`IdentityError`] if the identity cannot be marshaled; the current pair is kept.
    pub fn cert_key_bytes(&self, context: &X509Context) -> Result<(), IdentityError> {
        let (cert, key) = context.default_identity()?.marshal()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.cert = cert;
        state.key = key;
        Ok(())
    }

    /// The current PEM certificate chain and key.
    #[must_use]
    pub fn cert_key(&self) -> (Vec<u8>, Vec<u8>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        (state.cert.clone(), state.key.clone())
    }

    /// A [`CertificateGetter`] pairing the current certificate and key.
    ///
    /// Fails until the first snapshot has been written.
    #[must_use]
    pub fn new_certificate_getter(&self) -> CertificateGetter {
        let state = Arc::clone(&self.state);
        Arc::new(move || {
            let state = state.read().unwrap_or_else(PoisonError::into_inner);
            identity::certified_key(&state.cert, &state.key)
        })
    }

    /// Wait up to `max_seconds` for the bundle file to appear, checking at once
    /// and then once a second.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Timeout`] if it never appears.
    pub async fn wait_for_ca_bundle(&self, max_seconds: u64) -> Result<(), ManagerError> {
        if self.bundle_path.exists() {
            return Ok(());
        }
        for _ in 0..max_seconds {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.bundle_path.exists() {
                return Ok(());
            }
        }
        Err(ManagerError::Timeout)
    }

    fn persist_first(&self, context: &X509Context) -> Result<(), WriteError> {
        let bundle = context
            .bundle_for_default()
            .and_then(|bundle| bundle.marshal())
            .map_err(WriteError::MarshalBundle)?;
        let (cert, key) = context
            .default_identity()
            .and_then(identity::X509Identity::marshal)
            .map_err(WriteError::MarshalSvid)?;
        let hash: [u8; 32] = Sha256::digest(&bundle).into();

        write_file(
            Artifact::CaBundle,
            &self.bundle_path,
            &bundle,
            BUNDLE_FILE_MODE,
        )?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.last_hash.is_some() {
            return Ok(());
        }
        *state = State {
            last_hash: Some(hash),
            cert,
            key,
        };
        info!(path = %self.bundle_path.display(), "persisted initial CA bundle");
        Ok(())
    }
}

impl SvidWriter for CaBundleManager {
    fn write(&self, context: &X509Context) -> Result<(), WriteError> {
        let first = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_hash
            .is_none();
        if first {
            self.persist_first(context)?;
        }
        self.queue
            .enqueue(IDENTITY_TASK_NAME, Arc::new(context.clone()));
        Ok(())
    }
}
