//! Signing credentials, provisioning profiles and bundle identifier repair
//! for iOS CI builds.

pub mod bundle;
pub mod config;
pub mod crypto;
pub mod error;
pub mod export;
pub mod fetch;
pub mod ipa;
pub mod namespace;
pub mod profile;
pub mod repair;

pub use bundle::{NodeKind, PackageNode};
pub use config::{BuildConfig, ReconcilePolicy};
pub use crypto::{CredentialStore, KeychainSession, SigningCredential, ValidatedP12};
pub use error::{
    CredentialError, Error, ExportConfigError, NamespaceError, ProfileError, RepairIoError,
    ResidualCollision,
};
pub use export::{DistributionMethod, ExportConfigBuilder, ExportManifest};
pub use fetch::{RetryPolicy, Source};
pub use ipa::{extract_ipa, validate_ipa, CompressionLevel};
pub use namespace::{Aggressiveness, NamespaceAssignment, NamespaceEnforcer};
pub use profile::{ProfileResolver, ProvisioningProfile};
pub use repair::{PackageRepairEngine, RepairReport};

pub type Result<T> = std::result::Result<T, Error>;
