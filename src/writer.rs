// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

use std::{
    fs::{self, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
};

use crate::config::{BUNDLE_FILE_MODE, CERT_FILE_MODE, DiskSvidConfig, KEY_FILE_MODE};
use crate::error::{Artifact, WriteError};
use crate::identity::{TrustBundle, X509Context};
use crate::prelude::{debug, info};

/// Applies identity snapshots delivered by a [`CertManager`](crate::CertManager).
pub trait SvidWriter: Send + Sync {
    /// Apply `context`.
    ///
    /// # Errors
    ///
    /// Any [`WriteError`]; the manager treats it as fatal before startup completes.
    fn write(&self, context: &X509Context) -> Result<(), WriteError>;
}

/// Writes the default SVID, its key and trust bundle as PEM files.
#[derive(Debug, Clone)]
pub struct DiskSvidWriter {
    config: DiskSvidConfig,
}

impl DiskSvidWriter {
    /// Create a writer for `config`.
    ///
    /// # Errors
    ///
    /// [`WriteError::MissingDir`] if the certificate directory does not exist.
    pub fn new(config: DiskSvidConfig) -> Result<Self, WriteError> {
        match fs::metadata(config.dir()) {
            Ok(meta) if meta.is_dir() => Ok(Self { config }),
            Ok(_) => Err(WriteError::MissingDir {
                path: config.cert_dir.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
            }),
            Err(source) => Err(WriteError::MissingDir {
                path: config.cert_dir.clone(),
                source,
            }),
        }
    }

    /// Where this writer places its files.
    #[must_use]
    pub const fn config(&self) -> &DiskSvidConfig {
        &self.config
    }
}

impl SvidWriter for DiskSvidWriter {
    fn write(&self, context: &X509Context) -> Result<(), WriteError> {
        let identity = context
            .default_identity()
            .map_err(WriteError::MarshalSvid)?;
        let (certs, key) = identity.marshal().map_err(WriteError::MarshalSvid)?;
        let bundle = context
            .bundle_for_default()
            .and_then(TrustBundle::marshal)
            .map_err(WriteError::MarshalBundle)?;

        write_file(
            Artifact::Certificate,
            &self.config.cert_path(),
            &certs,
            CERT_FILE_MODE,
        )?;
        write_file(
            Artifact::CaBundle,
            &self.config.ca_bundle_path(),
            &bundle,
            BUNDLE_FILE_MODE,
        )?;
        write_file(
            Artifact::PrivateKey,
            &self.config.key_path(),
            &key,
            KEY_FILE_MODE,
        )?;

        info!(
            spiffe_id = %identity.spiffe_id(),
            dir = %self.config.cert_dir.display(),
            "wrote X509 SVID to disk"
        );
        Ok(())
    }
}

/// Write `contents` to `path` and set its mode, even when the file already existed.
pub(crate) fn write_file(
    artifact: Artifact,
    path: &Path,
    contents: &[u8],
    mode: u32,
) -> Result<(), WriteError> {
    let io_error = |source| WriteError::Io {
        artifact,
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(io_error)?;
    // `mode` only applies when the file is created.
    file.set_permissions(Permissions::from_mode(mode))
        .map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;
    debug!(path = %path.display(), %artifact, "wrote file");
    Ok(())
}
