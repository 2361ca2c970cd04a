// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, WatchError, WatchErrorKind};
use crate::identity::X509Context;
use crate::prelude::{debug, error, info, warn};

/// Stream of identity snapshots produced by a [`WatchClient`].
pub type X509ContextStream =
    Pin<Box<dyn Stream<Item = Result<X509Context, WatchError>> + Send + 'static>>;

const SPIRE_LOGS_HINT: &str = "For more information check the logs of the SPIRE agents and server.";

/// Client side of the identity agent's streaming API.
pub trait WatchClient: Send + Sync + 'static {
    /// Open the X509 context stream.
    fn watch_x509_contexts(
        &self,
    ) -> impl Future<Output = Result<X509ContextStream, WatchError>> + Send;

    /// Close the client. An open stream ends with a [`WatchErrorKind::Canceled`] error.
    ///
    /// # Errors
    ///
    /// Implementation specific failure to release the connection.
    fn close(&self) -> Result<(), WatchError>;
}

/// Fetches X509 identities from the identity agent.
pub trait CertFetcher: Send + Sync {
    /// Start watching for identity updates.
    ///
    /// Updates arrive on the first receiver in the order the agent sent them.
    /// At most one terminal error arrives on the second receiver; canceling
    /// `token` ends the watch without one.
    ///
    /// # Errors
    ///
    /// [`FetchError::NoClient`] if there is no client to watch with.
    fn start(
        &self,
        token: CancellationToken,
    ) -> Result<(mpsc::Receiver<Arc<X509Context>>, mpsc::Receiver<WatchError>), FetchError>;

    /// Close the underlying client. The fetcher cannot be started again afterwards.
    ///
    /// # Errors
    ///
    /// [`FetchError::NoClient`] if already stopped, or the client's close error.
    fn stop(&self) -> Result<(), FetchError>;
}

/// [`CertFetcher`] that forwards a [`WatchClient`]'s stream onto channels.
pub struct X509CertFetcher<C> {
    client: Mutex<Option<Arc<C>>>,
}

impl<C> std::fmt::Debug for X509CertFetcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let has_client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("X509CertFetcher")
            .field("has_client", &has_client)
            .finish()
    }
}

impl<C: WatchClient> X509CertFetcher<C> {
    /// Create a fetcher around `client`.
    pub fn new(client: C) -> Self {
        Self::from_client(Some(client))
    }

    /// Create a fetcher from an optional client. Without one, [`CertFetcher::start`] fails.
    pub fn from_client(client: Option<C>) -> Self {
        Self {
            client: Mutex::new(client.map(Arc::new)),
        }
    }
}

#[cfg(feature = "workload-api")]
impl X509CertFetcher<WorkloadApiWatcher> {
    /// Connect to the Workload API listening on `socket_path`.
    ///
    /// # Errors
    ///
    /// [`FetchError::Connect`] if the client cannot be created.
    pub async fn connect(socket_path: impl Into<String>) -> Result<Self, FetchError> {
        Ok(Self::new(WorkloadApiWatcher::connect(socket_path).await?))
    }

    /// Connect to the socket named by `SPIFFE_ENDPOINT_SOCKET`, or the default agent socket.
    ///
    /// # Errors
    ///
    /// [`FetchError::Connect`] if the client cannot be created.
    pub async fn from_env() -> Result<Self, FetchError> {
        Self::connect(crate::config::agent_socket_path()).await
    }
}

impl<C: WatchClient> CertFetcher for X509CertFetcher<C> {
    fn start(
        &self,
        token: CancellationToken,
    ) -> Result<(mpsc::Receiver<Arc<X509Context>>, mpsc::Receiver<WatchError>), FetchError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(FetchError::NoClient)?;

        // Capacity one is the closest tokio gets to a rendezvous channel: a slow
        // consumer stalls the watch instead of buffering updates.
        let (context_tx, context_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        tokio::spawn(watch(client, token, context_tx, error_tx));
        Ok((context_rx, error_rx))
    }

    fn stop(&self) -> Result<(), FetchError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(FetchError::NoClient)?;
        client.close().map_err(FetchError::from)
    }
}

async fn watch<C: WatchClient>(
    client: Arc<C>,
    token: CancellationToken,
    context_tx: mpsc::Sender<Arc<X509Context>>,
    error_tx: mpsc::Sender<WatchError>,
) {
    let result = tokio::select! {
        () = token.cancelled() => Ok(()),
        result = forward(client.as_ref(), &context_tx) => result,
    };

    if let Err(err) = client.close() {
        if !err.is_canceled() {
            warn!(error = %err, "error closing SPIFFE Workload API client");
        }
    }

    match result {
        Err(err) if !err.is_canceled() => {
            log_watch_error(&err);
            // The receiver may be gone already; nobody is left to tell.
            let _ = error_tx.send(err).await;
        }
        _ => {
            debug!("X509 context watch finished");
        }
    }
}

async fn forward<C: WatchClient>(
    client: &C,
    context_tx: &mpsc::Sender<Arc<X509Context>>,
) -> Result<(), WatchError> {
    let mut stream = client.watch_x509_contexts().await?;
    while let Some(update) = stream.next().await {
        let context = update?;
        if let Ok(identity) = context.default_identity() {
            info!(spiffe_id = %identity.spiffe_id(), "SVID updated");
        }
        if context_tx.send(Arc::new(context)).await.is_err() {
            debug!("X509 context receiver dropped; ending watch");
            return Ok(());
        }
    }
    Err(WatchError::new(
        WatchErrorKind::Other,
        "X509 context stream ended",
    ))
}

fn log_watch_error(err: &WatchError) {
    match err.kind() {
        WatchErrorKind::Unavailable | WatchErrorKind::PermissionDenied => {
            warn!(error = %err, hint = SPIRE_LOGS_HINT, "X509 SVID client {}", err.guidance());
        }
        WatchErrorKind::Canceled => {}
        WatchErrorKind::Other => {
            error!(error = %err, hint = SPIRE_LOGS_HINT, "X509 SVID client error");
        }
    }
}

#[cfg(feature = "workload-api")]
pub use workload_api::WorkloadApiWatcher;

#[cfg(feature = "workload-api")]
mod workload_api {
    use std::{
        future::Future,
        pin::Pin,
        sync::{Arc, Mutex, PoisonError},
        task::{Context, Poll},
    };

    use spiffe::{TrustDomain, WorkloadApiClient, error::GrpcClientError};
    use tokio_stream::Stream;
    use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

    use super::{WatchClient, X509ContextStream};
    use crate::error::{FetchError, WatchError, WatchErrorKind};
    use crate::identity::X509Context;

    /// [`WatchClient`] backed by the SPIFFE Workload API.
    pub struct WorkloadApiWatcher {
        client: Mutex<Option<WorkloadApiClient>>,
        closed: CancellationToken,
        socket_path: String,
        federates_with: Arc<[TrustDomain]>,
    }

    impl std::fmt::Debug for WorkloadApiWatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("WorkloadApiWatcher")
                .field("socket_path", &self.socket_path)
                .field("federates_with", &self.federates_with)
                .field("closed", &self.closed.is_cancelled())
                .finish_non_exhaustive()
        }
    }

    impl WorkloadApiWatcher {
        /// Connect to the Workload API listening on `socket_path`, e.g.
        /// `unix:///run/spire/sockets/agent.sock`.
        ///
        /// # Errors
        ///
        /// [`FetchError::Connect`] if the client cannot be created.
        pub async fn connect(socket_path: impl Into<String>) -> Result<Self, FetchError> {
            let socket_path = socket_path.into();
            let client = WorkloadApiClient::new_from_path(socket_path.as_str())
                .await
                .map_err(|e| FetchError::Connect {
                    path: socket_path.clone(),
                    message: e.to_string(),
                })?;
            Ok(Self {
                client: Mutex::new(Some(client)),
                closed: CancellationToken::new(),
                socket_path,
                federates_with: Arc::from([]),
            })
        }

        /// Also copy the trust bundles of these federated trust domains out of
        /// every update.
        #[must_use]
        pub fn with_federated_trust_domains(
            mut self,
            trust_domains: impl IntoIterator<Item = TrustDomain>,
        ) -> Self {
            self.federates_with = trust_domains.into_iter().collect();
            self
        }
    }

    impl WatchClient for WorkloadApiWatcher {
        async fn watch_x509_contexts(&self) -> Result<X509ContextStream, WatchError> {
            let client = self
                .client
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let mut client = client.ok_or_else(|| {
                WatchError::new(WatchErrorKind::Canceled, "workload API client is closed")
            })?;
            let inner = client.stream_x509_contexts().await?;
            Ok(Box::pin(WorkloadContextStream {
                inner: Box::pin(inner),
                closed: Box::pin(self.closed.clone().cancelled_owned()),
                federates_with: Arc::clone(&self.federates_with),
            }))
        }

        fn close(&self) -> Result<(), WatchError> {
            self.closed.cancel();
            drop(
                self.client
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(),
            );
            Ok(())
        }
    }

    /// Converts Workload API updates and ends once the watcher is closed.
    struct WorkloadContextStream {
        inner: Pin<
            Box<dyn Stream<Item = Result<spiffe::X509Context, GrpcClientError>> + Send + 'static>,
        >,
        closed: Pin<Box<WaitForCancellationFutureOwned>>,
        federates_with: Arc<[TrustDomain]>,
    }

    impl Stream for WorkloadContextStream {
        type Item = Result<X509Context, WatchError>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            if self.closed.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Some(Err(WatchError::new(
                    WatchErrorKind::Canceled,
                    "workload API client closed",
                ))));
            }
            let polled = self.inner.as_mut().poll_next(cx);
            match polled {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
                Poll::Ready(Some(Ok(context))) => {
                    Poll::Ready(Some(Ok(X509Context::from_workload_api(
                        &context,
                        &self.federates_with,
                    ))))
                }
            }
        }
    }

    impl From<GrpcClientError> for WatchError {
        fn from(err: GrpcClientError) -> Self {
            let kind = match &err {
                GrpcClientError::Grpc(status) => match status.code() {
                    tonic::Code::Unavailable => WatchErrorKind::Unavailable,
                    tonic::Code::PermissionDenied => WatchErrorKind::PermissionDenied,
                    tonic::Code::Cancelled => WatchErrorKind::Canceled,
                    _ => WatchErrorKind::Other,
                },
                GrpcClientError::Transport(_) => WatchErrorKind::Unavailable,
                _ => WatchErrorKind::Other,
            };
            Self::new(kind, err.to_string())
        }
    }
}
