//! Keychain installation of signing identities.
//!
//! `codesign` and `xcodebuild` only see identities that live in a keychain
//! on the user's search list, with a partition list that lets them use the
//! private key without an interactive prompt. This module owns that side
//! effect:
//!
//! - [`KeychainSession`] creates an ephemeral keychain for the build,
//!   unlocks it, puts it on the search list and deletes it on drop.
//! - [`CredentialStore::install`] imports a [`ValidatedP12`] using a fixed
//!   ladder of strategies, stopping at the first that works.
//!
//! Every `security` invocation goes through a [`CommandRunner`] and holds a
//! process-wide lock, since the keychain database is shared mutable state.

use crate::crypto::credential::{ingest, CredentialInput, ValidatedP12};
use crate::error::CredentialError;
use crate::Result;
use secrecy::{ExposeSecret, SecretString};
use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Path of Apple's keychain tool.
pub const SECURITY_TOOL: &str = "/usr/bin/security";

/// Partition list that lets Apple's signing tools use an imported key.
pub const PARTITION_LIST: &str = "apple-tool:,apple:,codesign:";

/// Keychain auto-lock timeout in seconds; long enough for any CI build.
const LOCK_TIMEOUT_SECS: &str = "21600";

static KEYCHAIN_LOCK: Mutex<()> = Mutex::new(());

fn keychain_lock() -> MutexGuard<'static, ()> {
    KEYCHAIN_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Best single-line explanation of a failure.
    pub fn reason(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.is_empty() {
            "exited with failure status".to_string()
        } else {
            text.lines().last().unwrap_or(text).to_string()
        }
    }
}

/// Runs external tools. Swapped out in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput>;
}

/// Runs commands with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[OsString]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A keychain file and the password that unlocks it.
pub struct Keychain {
    path: PathBuf,
    password: SecretString,
}

impl Keychain {
    pub fn new(path: impl Into<PathBuf>, password: SecretString) -> Self {
        Self {
            path: path.into(),
            password,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Keychain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keychain").field("path", &self.path).finish_non_exhaustive()
    }
}

/// An unlocked keychain held for the lifetime of a build.
///
/// Created keychains are removed from the search list and deleted on drop.
/// Opened keychains are only unlocked and left in place.
pub struct KeychainSession {
    keychain: Keychain,
    runner: Arc<dyn CommandRunner>,
    previous_search_list: Vec<PathBuf>,
    owned: bool,
}

impl KeychainSession {
    /// Create a fresh keychain, unlock it and prepend it to the user search
    /// list. An existing file at `path` is deleted first.
    pub fn create(runner: Arc<dyn CommandRunner>, keychain: Keychain) -> Result<Self> {
        let _guard = keychain_lock();
        let path = keychain.path().to_path_buf();
        let password = keychain.password().expose_secret().clone();

        if path.exists() {
            debug!(keychain = %path.display(), "deleting stale keychain");
            if let Err(reason) = security(runner.as_ref(), &[os("delete-keychain"), path.clone().into()]) {
                debug!(keychain = %path.display(), %reason, "could not delete stale keychain");
            }
        }

        run_checked(
            runner.as_ref(),
            &path,
            "create-keychain",
            &[os("create-keychain"), os("-p"), os(&password), path.clone().into()],
        )?;
        run_checked(
            runner.as_ref(),
            &path,
            "set-keychain-settings",
            &[
                os("set-keychain-settings"),
                os("-lut"),
                os(LOCK_TIMEOUT_SECS),
                path.clone().into(),
            ],
        )?;
        run_checked(
            runner.as_ref(),
            &path,
            "unlock-keychain",
            &[os("unlock-keychain"), os("-p"), os(&password), path.clone().into()],
        )?;

        let previous_search_list = read_search_list(runner.as_ref(), &path)?;
        let mut args = vec![os("list-keychains"), os("-d"), os("user"), os("-s"), path.clone().into()];
        args.extend(
            previous_search_list
                .iter()
                .filter(|p| **p != path)
                .map(|p| p.clone().into_os_string()),
        );
        run_checked(runner.as_ref(), &path, "list-keychains", &args)?;

        info!(keychain = %path.display(), "created build keychain");
        Ok(Self {
            keychain,
            runner,
            previous_search_list,
            owned: true,
        })
    }

    /// Unlock an existing keychain without taking ownership of it.
    pub fn open(runner: Arc<dyn CommandRunner>, keychain: Keychain) -> Result<Self> {
        let _guard = keychain_lock();
        let path = keychain.path().to_path_buf();
        let password = keychain.password().expose_secret().clone();
        run_checked(
            runner.as_ref(),
            &path,
            "unlock-keychain",
            &[os("unlock-keychain"), os("-p"), os(&password), path.clone().into()],
        )?;
        Ok(Self {
            keychain,
            runner,
            previous_search_list: Vec::new(),
            owned: false,
        })
    }

    pub fn keychain(&self) -> &Keychain {
        &self.keychain
    }

    /// Leave the keychain on disk and on the search list when the session
    /// ends, for builds that run in a later process.
    pub fn keep(&mut self) {
        if self.owned {
            info!(keychain = %self.keychain.path().display(), "keeping build keychain");
        }
        self.owned = false;
    }
}

impl Drop for KeychainSession {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        let _guard = keychain_lock();
        let path = self.keychain.path().to_path_buf();

        let mut args = vec![os("list-keychains"), os("-d"), os("user"), os("-s")];
        args.extend(
            self.previous_search_list
                .iter()
                .filter(|p| **p != path)
                .map(|p| p.clone().into_os_string()),
        );
        if let Err(e) = run_checked(self.runner.as_ref(), &path, "list-keychains", &args) {
            warn!(keychain = %path.display(), error = %e, "failed to restore keychain search list");
        }
        match run_checked(
            self.runner.as_ref(),
            &path,
            "delete-keychain",
            &[os("delete-keychain"), path.clone().into()],
        ) {
            Ok(()) => debug!(keychain = %path.display(), "deleted build keychain"),
            Err(e) => warn!(keychain = %path.display(), error = %e, "failed to delete build keychain"),
        }
    }
}

/// Import strategies, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStrategy {
    /// PKCS#12 with its password, trusted for every configured tool.
    FullAcl,
    /// PKCS#12 with an empty password, for containers exported without one.
    NoPassword,
    /// PKCS#12 with its password, trusted for `codesign` only.
    NarrowAcl,
    /// Certificate and private key imported as two separate items.
    SeparateItems,
}

impl ImportStrategy {
    pub const ALL: [ImportStrategy; 4] = [
        ImportStrategy::FullAcl,
        ImportStrategy::NoPassword,
        ImportStrategy::NarrowAcl,
        ImportStrategy::SeparateItems,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ImportStrategy::FullAcl => "full-acl",
            ImportStrategy::NoPassword => "no-password",
            ImportStrategy::NarrowAcl => "narrow-acl",
            ImportStrategy::SeparateItems => "separate-items",
        }
    }
}

impl fmt::Display for ImportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a successful [`CredentialStore::install`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstallReport {
    /// Strategy that imported the identity.
    pub strategy: ImportStrategy,
    /// Failed strategies before it, with their reasons.
    pub failed_attempts: Vec<(ImportStrategy, String)>,
    /// Whether `find-identity` lists the certificate afterwards.
    pub identity_visible: bool,
}

/// Validates credentials and installs them into a keychain.
pub struct CredentialStore {
    runner: Arc<dyn CommandRunner>,
    trusted_tools: Vec<PathBuf>,
}

impl CredentialStore {
    pub fn new(runner: Arc<dyn CommandRunner>, trusted_tools: Vec<PathBuf>) -> Self {
        Self {
            runner,
            trusted_tools,
        }
    }

    /// Store backed by the real `security` tool.
    pub fn system(trusted_tools: Vec<PathBuf>) -> Self {
        Self::new(Arc::new(SystemRunner), trusted_tools)
    }

    /// Create an ephemeral keychain through this store's runner.
    pub fn create_session(&self, keychain: Keychain) -> Result<KeychainSession> {
        KeychainSession::create(Arc::clone(&self.runner), keychain)
    }

    /// Validate a credential. See [`crate::crypto::ingest`].
    pub fn ingest(&self, input: CredentialInput) -> Result<ValidatedP12> {
        ingest(input)
    }

    /// Import `p12` into `keychain` and open its key to the signing tools.
    ///
    /// Strategies from [`ImportStrategy::ALL`] are tried in order. A failed
    /// strategy is logged and the next one tried; only when all four fail is
    /// [`CredentialError::ImportExhausted`] returned, listing every reason.
    pub fn install(&self, p12: &ValidatedP12, keychain: &Keychain) -> Result<InstallReport> {
        let _guard = keychain_lock();
        let runner = self.runner.as_ref();
        let kc_path = keychain.path();

        let p12_file = write_temp(".p12", p12.der())?;
        let mut failed_attempts = Vec::new();
        let mut imported = None;

        for strategy in ImportStrategy::ALL {
            let attempt = match strategy {
                ImportStrategy::SeparateItems => self.import_separately(p12, kc_path),
                _ => {
                    let args = self.p12_import_args(strategy, p12_file.path(), p12, kc_path);
                    security(runner, &args)
                }
            };

            match attempt {
                Ok(()) => {
                    info!(keychain = %kc_path.display(), strategy = %strategy, "imported signing identity");
                    imported = Some(strategy);
                    break;
                }
                Err(reason) => {
                    warn!(keychain = %kc_path.display(), strategy = %strategy, reason = %reason, "keychain import attempt failed");
                    failed_attempts.push((strategy, reason));
                }
            }
        }

        let Some(strategy) = imported else {
            return Err(CredentialError::ImportExhausted {
                keychain: kc_path.to_path_buf(),
                attempts: failed_attempts
                    .iter()
                    .map(|(s, r)| format!("{}: {}", s, r))
                    .collect(),
            }
            .into());
        };

        run_checked(
            runner,
            kc_path,
            "set-key-partition-list",
            &[
                os("set-key-partition-list"),
                os("-S"),
                os(PARTITION_LIST),
                os("-s"),
                os("-k"),
                os(keychain.password().expose_secret()),
                kc_path.to_path_buf().into(),
            ],
        )?;

        let identity_visible = self.identity_visible(p12, kc_path);
        if !identity_visible {
            warn!(
                keychain = %kc_path.display(),
                identity = %p12.credential().common_name,
                "imported identity is not listed as a valid codesigning identity"
            );
        }

        Ok(InstallReport {
            strategy,
            failed_attempts,
            identity_visible,
        })
    }

    fn p12_import_args(
        &self,
        strategy: ImportStrategy,
        p12_path: &Path,
        p12: &ValidatedP12,
        keychain: &Path,
    ) -> Vec<OsString> {
        let mut args = vec![
            os("import"),
            p12_path.to_path_buf().into(),
            os("-k"),
            keychain.to_path_buf().into(),
            os("-f"),
            os("pkcs12"),
            os("-P"),
        ];
        match strategy {
            ImportStrategy::NoPassword => args.push(os("")),
            _ => args.push(os(p12.credential().password().expose_secret())),
        }
        let tools: &[PathBuf] = match strategy {
            ImportStrategy::NarrowAcl => &self.trusted_tools[..self.trusted_tools.len().min(1)],
            _ => &self.trusted_tools,
        };
        for tool in tools {
            args.push(os("-T"));
            args.push(tool.clone().into_os_string());
        }
        args
    }

    fn import_separately(&self, p12: &ValidatedP12, keychain: &Path) -> std::result::Result<(), String> {
        let cert_pem = p12.certificate_pem().map_err(|e| e.to_string())?;
        let key_pem = p12.private_key_pem().map_err(|e| e.to_string())?;
        let cert_file = write_temp(".pem", &cert_pem).map_err(|e| e.to_string())?;
        let key_file =
            write_temp(".pem", key_pem.expose_secret().as_bytes()).map_err(|e| e.to_string())?;

        let cert_args = vec![
            os("import"),
            cert_file.path().to_path_buf().into(),
            os("-k"),
            keychain.to_path_buf().into(),
            os("-t"),
            os("cert"),
        ];
        let mut key_args = vec![
            os("import"),
            key_file.path().to_path_buf().into(),
            os("-k"),
            keychain.to_path_buf().into(),
            os("-t"),
            os("priv"),
        ];
        for tool in &self.trusted_tools {
            key_args.push(os("-T"));
            key_args.push(tool.clone().into_os_string());
        }

        security(self.runner.as_ref(), &cert_args).map_err(|r| format!("certificate: {}", r))?;
        security(self.runner.as_ref(), &key_args).map_err(|r| format!("private key: {}", r))
    }

    fn identity_visible(&self, p12: &ValidatedP12, keychain: &Path) -> bool {
        let args = [
            os("find-identity"),
            os("-v"),
            os("-p"),
            os("codesigning"),
            keychain.to_path_buf().into(),
        ];
        match self.runner.run(SECURITY_TOOL, &args) {
            Ok(out) if out.success => out
                .stdout
                .to_uppercase()
                .contains(&p12.credential().sha1_fingerprint),
            _ => false,
        }
    }
}

fn os(s: &str) -> OsString {
    OsString::from(s)
}

/// Run `security` and turn any failure into a one-line reason.
fn security(runner: &dyn CommandRunner, args: &[OsString]) -> std::result::Result<(), String> {
    match runner.run(SECURITY_TOOL, args) {
        Ok(out) if out.success => Ok(()),
        Ok(out) => Err(out.reason()),
        Err(e) => Err(format!("failed to run {}: {}", SECURITY_TOOL, e)),
    }
}

fn run_checked(runner: &dyn CommandRunner, keychain: &Path, operation: &str, args: &[OsString]) -> Result<()> {
    security(runner, args).map_err(|reason| {
        CredentialError::Keychain {
            operation: operation.to_string(),
            keychain: keychain.to_path_buf(),
            reason,
        }
        .into()
    })
}

fn read_search_list(runner: &dyn CommandRunner, keychain: &Path) -> Result<Vec<PathBuf>> {
    let args = [os("list-keychains"), os("-d"), os("user")];
    let out = runner.run(SECURITY_TOOL, &args).map_err(|e| CredentialError::Keychain {
        operation: "list-keychains".into(),
        keychain: keychain.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !out.success {
        return Err(CredentialError::Keychain {
            operation: "list-keychains".into(),
            keychain: keychain.to_path_buf(),
            reason: out.reason(),
        }
        .into());
    }
    Ok(parse_search_list(&out.stdout))
}

fn parse_search_list(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .map(|line| line.trim().trim_matches('"'))
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Write secret material to a private (0600) temp file removed on drop.
fn write_temp(suffix: &str, data: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("iosign-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}
