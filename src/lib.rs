// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Workload identity lifecycle for mesh components, backed by [`spiffe`] and [`rustls`].
//!
//! * [`CertFetcher`] streams X509-SVID updates from the local SPIFFE Workload API.
//! * [`CertManager`] waits for the first identity, applies it through an
//!   [`SvidWriter`] and keeps applying rotations in the background.
//! * [`DiskSvidWriter`] persists the identity as PEM files, [`CaBundleManager`]
//!   keeps it in memory for TLS and fans every update out through a [`TaskQueue`].
//! * [`SecureMessageBus`] opens an mTLS connection to the message broker using
//!   the rotating client certificate.

#![forbid(rust_2018_idioms)]
#![forbid(missing_docs, unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::nursery,
    clippy::dbg_macro,
    clippy::todo
)]

mod observability;
mod prelude;

pub mod config;
pub mod error;

mod ca_bundle;
mod fetcher;
mod identity;
mod manager;
mod task_queue;
mod tls;
mod writer;

#[cfg(test)]
mod test_support;

#[cfg(feature = "message-bus")]
mod bus;

pub use ca_bundle::{CaBundleManager, CertificateGetter};
pub use fetcher::{CertFetcher, WatchClient, X509CertFetcher, X509ContextStream};
#[cfg(feature = "workload-api")]
pub use fetcher::WorkloadApiWatcher;
pub use identity::{TrustBundle, X509Context, X509Identity};
pub use manager::{CertManager, Reloader};
pub use task_queue::{TaskQueue, WeakTaskQueue};
pub use tls::{InMemorySecureConfig, OnDiskSecureConfig, SecurableConfig, verify_server_certificate};
pub use writer::{DiskSvidWriter, SvidWriter};

#[cfg(feature = "message-bus")]
pub use bus::{BusOption, BusOptions, SecureMessageBus};
