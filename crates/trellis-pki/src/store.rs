//! Holder of the current identity bundle
//!
//! The store owns the one active [`CertificateBundle`] and its on-disk copy.
//! Readers get an `Arc<InstalledBundle>` snapshot: certificate, key and the
//! rustls signing key all come from the same installation, so a reader can
//! never pair a certificate with another generation's key.
//!
//! On disk every installation gets its own `gen-<n>/` directory (0700, files
//! 0600). Files are fully written before the `current` symlink is swapped to
//! point at the new directory with a rename, so a process that reads
//! `current/cert.pem` and `current/key.pem` never observes a half-written
//! file. The previous generation is kept until the next install.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustls::sign::CertifiedKey;
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bundle::CertificateBundle;
use crate::pki::PkiError;
use crate::tls::{self, TlsError};

/// File name of the leaf certificate inside a generation directory
pub const CERT_FILE: &str = "cert.pem";
/// File name of the private key inside a generation directory
pub const KEY_FILE: &str = "key.pem";
/// File name of the CA chain inside a generation directory
pub const CHAIN_FILE: &str = "ca.pem";
/// Name of the symlink pointing at the active generation
pub const CURRENT_LINK: &str = "current";

/// Errors installing a bundle
#[derive(Debug, Error)]
pub enum StoreError {
    /// Writing the bundle to disk failed
    #[error("failed to write certificate files: {0}")]
    Io(#[from] std::io::Error),

    /// The bundle could not be turned into a TLS signing key
    #[error("bundle unusable for TLS: {0}")]
    Tls(#[from] TlsError),

    /// The bundle failed a consistency check
    #[error(transparent)]
    Pki(#[from] PkiError),
}

/// Paths of one installed generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    /// Generation directory
    pub dir: PathBuf,
    /// Leaf certificate
    pub certificate: PathBuf,
    /// Private key
    pub private_key: PathBuf,
    /// CA chain
    pub trust_chain: PathBuf,
}

impl BundlePaths {
    fn in_dir(dir: PathBuf) -> Self {
        Self {
            certificate: dir.join(CERT_FILE),
            private_key: dir.join(KEY_FILE),
            trust_chain: dir.join(CHAIN_FILE),
            dir,
        }
    }
}

/// A bundle as installed in the store
#[derive(Debug)]
pub struct InstalledBundle {
    bundle: CertificateBundle,
    generation: u64,
    paths: BundlePaths,
    certified_key: Arc<CertifiedKey>,
}

impl InstalledBundle {
    /// The bundle
    pub fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }

    /// Install counter, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Where this generation lives on disk
    pub fn paths(&self) -> &BundlePaths {
        &self.paths
    }

    /// Signing key and chain for TLS, built from this bundle
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }
}

/// Explicitly owned holder of the worker's current identity
pub struct CertificateStore {
    root: PathBuf,
    _tempdir: Option<TempDir>,
    current: RwLock<Option<Arc<InstalledBundle>>>,
    install_lock: Mutex<()>,
    generation: AtomicU64,
    updates: watch::Sender<u64>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("root", &self.root)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl CertificateStore {
    /// Store backed by a private temporary directory, removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        let dir = tempfile::Builder::new()
            .prefix("trellis-certs-")
            .tempdir()?;
        let root = dir.path().to_path_buf();
        Ok(Self::with_root(root, Some(dir)))
    }

    fn with_root(root: PathBuf, tempdir: Option<TempDir>) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            root,
            _tempdir: tempdir,
            current: RwLock::new(None),
            install_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            updates,
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable paths through the `current` symlink
    pub fn current_paths(&self) -> BundlePaths {
        BundlePaths::in_dir(self.root.join(CURRENT_LINK))
    }

    /// Snapshot of the active bundle
    pub fn current(&self) -> Option<Arc<InstalledBundle>> {
        self.current.read().clone()
    }

    /// Number of state changes so far (installs and clears)
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Receiver notified with the new generation on every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    /// Atomically replace the active bundle
    ///
    /// Either everything (files, symlink, in-memory snapshot) moves to the
    /// new bundle, or nothing visible changes.
    pub fn install(&self, bundle: CertificateBundle) -> Result<Arc<InstalledBundle>, StoreError> {
        let _guard = self.install_lock.lock();

        if !bundle.key_matches_certificate()? {
            return Err(PkiError::PublicKeyMismatch.into());
        }
        let certified_key = tls::certified_key(&bundle)?;

        let generation = self.generation.load(Ordering::SeqCst) + 1;
        let paths = self.write_generation(generation, &bundle)?;
        self.point_current_at(&paths.dir)?;

        let installed = Arc::new(InstalledBundle {
            bundle,
            generation,
            paths,
            certified_key,
        });

        *self.current.write() = Some(installed.clone());
        self.generation.store(generation, Ordering::SeqCst);
        self.updates.send_replace(generation);

        info!(
            generation,
            identity = %installed.bundle.subject_identity(),
            serial = %installed.bundle.info().serial,
            not_after = installed.bundle.info().not_after,
            "Installed certificate bundle"
        );

        self.prune_before(generation.saturating_sub(1));
        Ok(installed)
    }

    /// Drop the active bundle; TLS resolvers stop serving a certificate
    pub fn clear(&self) {
        let _guard = self.install_lock.lock();
        if self.current.write().take().is_some() {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.updates.send_replace(generation);
            warn!(generation, "Cleared certificate bundle");
        }
    }

    fn write_generation(&self, generation: u64, bundle: &CertificateBundle) -> std::io::Result<BundlePaths> {
        let dir = self.root.join(format!("gen-{}", generation));
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        create_private_dir(&dir)?;

        let paths = BundlePaths::in_dir(dir);
        write_private_file(&paths.certificate, bundle.certificate_pem().as_bytes())?;
        write_private_file(&paths.private_key, bundle.private_key_pem().as_bytes())?;
        write_private_file(&paths.trust_chain, bundle.trust_chain_pem().join("\n").as_bytes())?;
        Ok(paths)
    }

    #[cfg(unix)]
    fn point_current_at(&self, dir: &Path) -> std::io::Result<()> {
        let staging = self.root.join(format!("{}.tmp", CURRENT_LINK));
        if fs::symlink_metadata(&staging).is_ok() {
            fs::remove_file(&staging)?;
        }
        let target = dir
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| dir.to_path_buf());
        std::os::unix::fs::symlink(target, &staging)?;
        fs::rename(&staging, self.root.join(CURRENT_LINK))
    }

    #[cfg(not(unix))]
    fn point_current_at(&self, _dir: &Path) -> std::io::Result<()> {
        Ok(())
    }

    fn prune_before(&self, keep_from: u64) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(generation) = name
                .to_str()
                .and_then(|n| n.strip_prefix("gen-"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            if generation < keep_from {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    debug!(generation, error = %e, "Failed to remove old certificate generation");
                }
            }
        }
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
