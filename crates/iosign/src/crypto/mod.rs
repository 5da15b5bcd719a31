pub mod credential;
pub mod keychain;

pub use credential::{
    ingest, CredentialInput, CredentialKind, P12Encryption, SigningCredential, ValidatedP12,
};
pub use keychain::{
    CommandOutput, CommandRunner, CredentialStore, ImportStrategy, InstallReport, Keychain,
    KeychainSession, SystemRunner,
};
