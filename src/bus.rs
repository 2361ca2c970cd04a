// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError, RwLock},
    time::Duration,
};

use async_nats::{Client, ConnectOptions, connection::State};
use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::StreamExt;

use crate::error::{BusError, ConfigError};
use crate::prelude::{debug, info, warn};
use crate::tls::SecurableConfig;

/// Connect option layered over the secure defaults of a [`SecureMessageBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BusOption {
    /// Client name reported to the broker.
    Name(String),
    /// Give up after this many reconnect attempts.
    MaxReconnects(usize),
    /// Keep reconnecting forever.
    UnlimitedReconnects,
    /// Timeout of a single connection attempt.
    ConnectionTimeout(Duration),
    /// Interval between keep-alive pings.
    PingInterval(Duration),
    /// Keep retrying when the first connection attempt fails.
    RetryOnInitialConnect,
}

/// Connect settings of a [`SecureMessageBus`]. TLS is always required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusOptions {
    name: Option<String>,
    max_reconnects: Option<Option<usize>>,
    connection_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    retry_on_initial_connect: bool,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl BusOptions {
    /// Secure defaults: TLS required, client library defaults for everything else.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            name: None,
            max_reconnects: None,
            connection_timeout: None,
            ping_interval: None,
            retry_on_initial_connect: false,
        }
    }

    /// Apply `option`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConflictingOption`] if `option` contradicts one applied earlier
    /// or carries a zero duration.
    pub fn apply(&mut self, option: BusOption) -> Result<(), ConfigError> {
        match option {
            BusOption::Name(name) => set_once(&mut self.name, name, "name"),
            BusOption::MaxReconnects(max) => {
                set_once(&mut self.max_reconnects, Some(max), "reconnect limit")
            }
            BusOption::UnlimitedReconnects => {
                set_once(&mut self.max_reconnects, None, "reconnect limit")
            }
            BusOption::ConnectionTimeout(timeout) => {
                non_zero(timeout, "connection timeout")?;
                set_once(&mut self.connection_timeout, timeout, "connection timeout")
            }
            BusOption::PingInterval(interval) => {
                non_zero(interval, "ping interval")?;
                set_once(&mut self.ping_interval, interval, "ping interval")
            }
            BusOption::RetryOnInitialConnect => {
                self.retry_on_initial_connect = true;
                Ok(())
            }
        }
    }

    fn connect_options(&self, tls: rustls::ClientConfig) -> ConnectOptions {
        let mut options = ConnectOptions::new()
            .require_tls(true)
            .tls_client_config(tls);
        if let Some(name) = &self.name {
            options = options.name(name.as_str());
        }
        if let Some(max) = self.max_reconnects {
            options = options.max_reconnects(max);
        }
        if let Some(timeout) = self.connection_timeout {
            options = options.connection_timeout(timeout);
        }
        if let Some(interval) = self.ping_interval {
            options = options.ping_interval(interval);
        }
        if self.retry_on_initial_connect {
            options = options.retry_on_initial_connect();
        }
        options
    }
}

fn set_once<T: PartialEq>(slot: &mut Option<T>, value: T, what: &str) -> Result<(), ConfigError> {
    match slot {
        Some(current) if *current != value => Err(ConfigError::ConflictingOption(format!(
            "{what} set twice with different values"
        ))),
        _ => {
            *slot = Some(value);
            Ok(())
        }
    }
}

fn non_zero(duration: Duration, what: &str) -> Result<(), ConfigError> {
    if duration.is_zero() {
        return Err(ConfigError::ConflictingOption(format!(
            "{what} must be positive"
        )));
    }
    Ok(())
}

/// Mutually authenticated publish/subscribe client for the internal message broker.
///
/// The configuration is validated and turned into a TLS 1.3 client config
/// once, at construction. Every handshake then resolves the current client
/// certificate and verifies the broker against the configured server name.
pub struct SecureMessageBus {
    options: BusOptions,
    tls: rustls::ClientConfig,
    client: RwLock<Option<Client>>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for SecureMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureMessageBus")
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SecureMessageBus {
    /// Validate `config` and prepare its TLS configuration.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidConfig`] if validation or TLS setup fails.
    pub fn new<C>(config: &C) -> Result<Self, BusError>
    where
        C: SecurableConfig + ?Sized,
    {
        config.validate()?;
        let tls = config.create_tls_config()?;
        Ok(Self {
            options: BusOptions::new(),
            tls,
            client: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Connect to the broker at `url`, applying `options` over the secure defaults.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidConfig`] for conflicting options, [`BusError::Connect`]
    /// if the connection or handshake fails.
    pub async fn connect(
        &self,
        url: &str,
        options: impl IntoIterator<Item = BusOption>,
    ) -> Result<(), BusError> {
        let mut settings = self.options.clone();
        for option in options {
            settings.apply(option)?;
        }
        let client = settings
            .connect_options(self.tls.clone())
            .connect(url)
            .await
            .map_err(BusError::Connect)?;
        info!(url, "connected to message bus");

        let previous = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(client);
        if previous.is_some() {
            debug!("replaced existing message bus connection");
        }
        Ok(())
    }

    /// Whether a connection exists and is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|client| matches!(client.connection_state(), State::Connected))
    }

    /// Publish `payload` on `subject`.
    ///
    /// # Errors
    ///
    /// [`BusError::NoConnection`] when not connected, [`BusError::Publish`] otherwise.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<(), BusError> {
        let client = self.connected()?;
        client
            .publish(subject.to_owned(), payload.into())
            .await
            .map_err(|source| BusError::Publish {
                subject: subject.to_owned(),
                source,
            })
    }

    /// Deliver the payload of every message on `subject` to `messages`.
    ///
    /// Delivery waits while `messages` is full and stops once it is closed.
    ///
    /// # Errors
    ///
    /// [`BusError::NoConnection`] when not connected, [`BusError::AlreadySubscribed`]
    /// if `subject` already has a handler, [`BusError::Subscribe`] otherwise.
    pub async fn subscribe(
        &self,
        subject: &str,
        messages: mpsc::Sender<Bytes>,
    ) -> Result<(), BusError> {
        let client = self.connected()?;
        if self.is_subscribed(subject) {
            return Err(BusError::AlreadySubscribed(subject.to_owned()));
        }
        let mut subscriber = client
            .subscribe(subject.to_owned())
            .await
            .map_err(|source| BusError::Subscribe {
                subject: subject.to_owned(),
                source,
            })?;

        let topic = subject.to_owned();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if messages.send(message.payload).await.is_err() {
                    debug!(subject = %topic, "subscription receiver dropped");
                    break;
                }
            }
        });

        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscriptions
            .get(subject)
            .is_some_and(|existing| !existing.is_finished())
        {
            // A concurrent subscribe for the same subject won.
            handle.abort();
            return Err(BusError::AlreadySubscribed(subject.to_owned()));
        }
        subscriptions.insert(subject.to_owned(), handle);
        info!(subject, "subscribed to message bus subject");
        Ok(())
    }

    /// Drop all subscriptions, flush pending publishes and release the connection.
    ///
    /// # Errors
    ///
    /// [`BusError::NoConnection`] if there is no connection, [`BusError::Close`]
    /// if flushing fails.
    pub async fn close(&self) -> Result<(), BusError> {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BusError::NoConnection)?;
        for (subject, handle) in self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            debug!(subject = %subject, "dropping subscription");
            handle.abort();
        }
        client.flush().await.map_err(|e| {
            warn!(error = %e, "failed to flush message bus connection");
            BusError::Close(Box::new(e))
        })?;
        info!("closed message bus connection");
        Ok(())
    }

    fn connected(&self) -> Result<Client, BusError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|client| matches!(client.connection_state(), State::Connected))
            .cloned()
            .ok_or(BusError::NoConnection)
    }

    fn is_subscribed(&self, subject: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .is_some_and(|handle| !handle.is_finished())
    }
}
