//! Identity certificates for Trellis workers
//!
//! - [`pki`]: key/CSR generation, the signing authority, and validation of
//!   what the authority returns
//! - [`bundle`]: a validated certificate with its private key
//! - [`store`]: the atomically swapped holder of the current bundle
//! - [`tls`]: rustls server configuration resolving certificates from the store

pub mod bundle;
pub mod pki;
pub mod store;
pub mod tls;

pub use bundle::CertificateBundle;
pub use pki::{
    inspect_csr, service_identity, unix_now, validate_issued_certificate, CertificateAuthority,
    CertificateInfo, IssuedCertificateExpectations, PkiError, WorkerCertRequest,
};
pub use store::{BundlePaths, CertificateStore, InstalledBundle, StoreError};
pub use tls::{server_config, ClientAuth, StoreCertResolver, TlsError};
