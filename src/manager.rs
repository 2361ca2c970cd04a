// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, FetchError, ManagerError, WatchError, WriteError};
use crate::fetcher::CertFetcher;
use crate::identity::X509Context;
use crate::prelude::{debug, error, info, warn};
use crate::writer::SvidWriter;

/// Hook invoked after every applied identity, e.g. to make a process reload its certificates.
pub trait Reloader: Send + Sync {
    /// Reload.
    ///
    /// # Errors
    ///
    /// Forwarded on the manager's error channel; never stops the manager.
    fn reload(&self) -> Result<(), BoxError>;
}

impl<F> Reloader for F
where
    F: Fn() -> Result<(), BoxError> + Send + Sync,
{
    fn reload(&self) -> Result<(), BoxError> {
        self()
    }
}

/// Waits for the first identity from a [`CertFetcher`], applies it through an
/// [`SvidWriter`] and keeps applying rotations in the background.
///
/// Failures after startup are delivered on the channel returned by
/// [`CertManager::take_errors`].
pub struct CertManager {
    writer: Arc<dyn SvidWriter>,
    fetcher: Arc<dyn CertFetcher>,
    reloader: Option<Arc<dyn Reloader>>,
    timeout: Duration,
    errors_tx: mpsc::UnboundedSender<ManagerError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagerError>>>,
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("timeout", &self.timeout)
            .field("has_reloader", &self.reloader.is_some())
            .finish_non_exhaustive()
    }
}

impl CertManager {
    /// Create a manager that gives up if no identity arrives within `timeout`.
    pub fn new(
        writer: Arc<dyn SvidWriter>,
        fetcher: Arc<dyn CertFetcher>,
        timeout: Duration,
    ) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            writer,
            fetcher,
            reloader: None,
            timeout,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Like [`CertManager::new`], calling `reloader` after every applied identity.
    pub fn with_reloader(
        reloader: Arc<dyn Reloader>,
        writer: Arc<dyn SvidWriter>,
        fetcher: Arc<dyn CertFetcher>,
        timeout: Duration,
    ) -> Self {
        Self {
            reloader: Some(reloader),
            ..Self::new(writer, fetcher, timeout)
        }
    }

    /// Take the receiving end of the error channel. Returns `None` after the first call.
    pub fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<ManagerError>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Start the fetcher and wait for the first identity.
    ///
    /// Returns once the first identity has been applied, leaving a background
    /// task that applies every later one. Reload failures and the error that
    /// ends the background task are sent on the error channel. Canceling
    /// `token` ends the background task with a single [`ManagerError::Canceled`].
    ///
    /// # Errors
    ///
    /// Whichever comes first of: the fetcher failing to start or failing before
    /// the first identity, the first write failing, [`ManagerError::Timeout`]
    /// or [`ManagerError::Canceled`].
    pub async fn run(&self, token: CancellationToken) -> Result<(), ManagerError> {
        let (mut contexts, mut errors) = self
            .fetcher
            .start(token.clone())
            .map_err(ManagerError::StartFetcher)?;

        let applier = Applier {
            writer: Arc::clone(&self.writer),
            reloader: self.reloader.clone(),
            errors_tx: self.errors_tx.clone(),
        };

        tokio::select! {
            biased;
            () = token.cancelled() => return Err(ManagerError::Canceled),
            context = contexts.recv() => match context {
                Some(context) => {
                    info!("received initial trust bundle");
                    applier.apply(context).await.map_err(ManagerError::Write)?;
                }
                None => return Err(initial_failure(errors.recv().await)),
            },
            err = errors.recv() => return Err(initial_failure(err)),
            () = tokio::time::sleep(self.timeout) => {
                warn!(timeout = ?self.timeout, "timed out waiting for trust bundle");
                return Err(ManagerError::Timeout);
            }
        }

        tokio::spawn(applier.stream(contexts, errors, token));
        Ok(())
    }

    /// Stop the fetcher. Does not wait for the background task; it ends once the
    /// fetcher's channels close.
    ///
    /// # Errors
    ///
    /// The fetcher's stop error.
    pub fn stop(&self) -> Result<(), FetchError> {
        self.fetcher.stop()
    }
}

fn initial_failure(err: Option<WatchError>) -> ManagerError {
    err.map_or(ManagerError::StreamClosed, ManagerError::InitialBundle)
}

struct Applier {
    writer: Arc<dyn SvidWriter>,
    reloader: Option<Arc<dyn Reloader>>,
    errors_tx: mpsc::UnboundedSender<ManagerError>,
}

impl Applier {
    async fn apply(&self, context: Arc<X509Context>) -> Result<(), WriteError> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || writer.write(&context))
            .await
            .map_err(|err| WriteError::Interrupted(err.to_string()))??;
        if let Some(reloader) = &self.reloader {
            if let Err(err) = reloader.reload() {
                error!(error = %err, "error reloading after certificate update");
                self.report(ManagerError::Reload(err));
            }
        }
        Ok(())
    }

    fn report(&self, err: ManagerError) {
        if self.errors_tx.send(err).is_err() {
            debug!("cert manager error receiver dropped");
        }
    }

    async fn stream(
        self,
        mut contexts: mpsc::Receiver<Arc<X509Context>>,
        mut errors: mpsc::Receiver<WatchError>,
        token: CancellationToken,
    ) {
        let last = loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break ManagerError::Canceled,
                err = errors.recv() => {
                    break err.map_or(ManagerError::StreamClosed, ManagerError::Stream);
                }
                context = contexts.recv() => match context {
                    Some(context) => {
                        if let Err(err) = self.apply(context).await {
                            break ManagerError::Write(err);
                        }
                    }
                    None => break errors.recv().await.map_or(ManagerError::StreamClosed, ManagerError::Stream),
                },
            }
        };
        info!(reason = %last, "cert manager update loop exiting");
        self.report(last);
    }
}
