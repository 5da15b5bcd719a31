//! Command-line interface for iosign.
//!
//! Resolves signing credentials into a build keychain, repairs bundle
//! identifier collisions in built packages and writes `ExportOptions.plist`.
//!
//! Exit codes: `0` success, `1` validation failure, `2` residual collision.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use iosign::crypto::{ingest, CredentialInput, CredentialStore, Keychain, ValidatedP12};
use iosign::error::EXIT_VALIDATION;
use iosign::export::{ExportConfigBuilder, ExportOptions};
use iosign::profile::{ProfileResolver, ProvisioningProfile};
use iosign::repair::PackageRepairEngine;
use iosign::{BuildConfig, Source};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "iosign")]
#[command(author, version, about = "iOS signing credentials, profiles and bundle id repair for CI")]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(long, global = true, env = "IOSIGN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the signing credential and profile, and install the identity
    /// into a build keychain
    ResolveCredentials {
        #[command(flatten)]
        credential: CredentialArgs,

        /// Provisioning profile (path, URL or base64:<data>)
        #[arg(long, env = "IOSIGN_PROFILE")]
        profile: Option<Source>,

        /// Requested main bundle identifier
        #[arg(long, env = "IOSIGN_BUNDLE_ID")]
        bundle_id: Option<String>,

        /// Keychain file to create
        #[arg(long, env = "IOSIGN_KEYCHAIN")]
        keychain: Option<PathBuf>,

        /// Password for the build keychain
        #[arg(long, env = "IOSIGN_KEYCHAIN_PASSWORD", hide_env_values = true)]
        keychain_password: Option<String>,

        /// Only validate; do not touch any keychain
        #[arg(long)]
        no_install: bool,

        /// Write the JSON summary here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Give every nested bundle a unique identifier
    RepairNamespace {
        /// .ipa, .xcarchive, .app or a directory with Pods build settings
        path: PathBuf,

        /// Main bundle identifier (required for Pods build settings)
        #[arg(long, env = "IOSIGN_BUNDLE_ID")]
        bundle_id: Option<String>,

        /// Where to write the repaired IPA (default: in place)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the JSON repair report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Write ExportOptions.plist for xcodebuild -exportArchive
    BuildExportOptions {
        /// Distribution method (app-store, ad-hoc, enterprise, development)
        #[arg(long)]
        method: Option<String>,

        /// Provisioning profile (path, URL or base64:<data>)
        #[arg(long, env = "IOSIGN_PROFILE")]
        profile: Option<Source>,

        /// Main bundle identifier
        #[arg(long, env = "IOSIGN_BUNDLE_ID")]
        bundle_id: Option<String>,

        #[command(flatten)]
        credential: CredentialArgs,

        /// OTA manifest URL for ad-hoc installs
        #[arg(long)]
        install_url: Option<String>,

        #[arg(long)]
        display_image_url: Option<String>,

        #[arg(long)]
        full_size_image_url: Option<String>,

        /// Output plist
        #[arg(long, default_value = "ExportOptions.plist")]
        out: PathBuf,
    },
}

#[derive(Args)]
struct CredentialArgs {
    /// PKCS#12 container (path, URL or base64:<data>)
    #[arg(long, env = "IOSIGN_P12")]
    p12: Option<Source>,

    /// Password of the PKCS#12 container
    #[arg(long, env = "IOSIGN_P12_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Certificate (.cer DER or PEM)
    #[arg(long, env = "IOSIGN_CERTIFICATE")]
    certificate: Option<Source>,

    /// RSA private key (PEM or DER PKCS#8)
    #[arg(long, env = "IOSIGN_PRIVATE_KEY")]
    private_key: Option<Source>,
}

impl CredentialArgs {
    fn apply(self, config: &mut BuildConfig) {
        let c = &mut config.credential;
        if let Some(p12) = self.p12 {
            c.p12 = Some(p12);
        }
        if let Some(password) = self.password {
            c.password = Some(SecretString::new(password));
        }
        if let Some(certificate) = self.certificate {
            c.certificate = Some(certificate);
        }
        if let Some(key) = self.private_key {
            c.private_key = Some(key);
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<iosign::Error>()
                .map(iosign::Error::exit_code)
                .unwrap_or(EXIT_VALIDATION);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => BuildConfig::load(path)?,
        None => BuildConfig::default(),
    };

    match cli.command {
        Commands::ResolveCredentials {
            credential,
            profile,
            bundle_id,
            keychain,
            keychain_password,
            no_install,
            out,
        } => {
            credential.apply(&mut config);
            if profile.is_some() {
                config.profile.source = profile;
            }
            if bundle_id.is_some() {
                config.bundle_id = bundle_id;
            }
            if keychain.is_some() {
                config.keychain.path = keychain;
            }
            if let Some(password) = keychain_password {
                config.keychain.password = Some(SecretString::new(password));
            }
            config.validate()?;
            resolve_credentials(&config, no_install, out.as_deref())
        }

        Commands::RepairNamespace {
            path,
            bundle_id,
            output,
            report,
        } => {
            if bundle_id.is_some() {
                config.bundle_id = bundle_id;
            }
            config.validate()?;

            let mut engine = PackageRepairEngine::from_config(&config);
            if let Some(output) = output {
                engine = engine.output(output);
            }
            let repair = engine.repair(&path)?;
            println!("{repair}");
            if let Some(report) = report {
                repair.write_json(&report)?;
                info!(report = %report.display(), "wrote repair report");
            }
            repair.into_result()?;
            Ok(())
        }

        Commands::BuildExportOptions {
            method,
            profile,
            bundle_id,
            credential,
            install_url,
            display_image_url,
            full_size_image_url,
            out,
        } => {
            credential.apply(&mut config);
            if profile.is_some() {
                config.profile.source = profile;
            }
            if bundle_id.is_some() {
                config.bundle_id = bundle_id;
            }
            if method.is_some() {
                config.export.method = method;
            }
            if install_url.is_some() {
                config.export.install_url = install_url;
            }
            if display_image_url.is_some() {
                config.export.display_image_url = display_image_url;
            }
            if full_size_image_url.is_some() {
                config.export.full_size_image_url = full_size_image_url;
            }
            config.validate()?;
            build_export_options(&config, &out)
        }
    }
}

fn resolve_credentials(config: &BuildConfig, no_install: bool, out: Option<&Path>) -> anyhow::Result<()> {
    let Some(p12) = load_credential(config)? else {
        bail!("no signing credential given: pass --p12, or --certificate with --private-key");
    };
    let credential = p12.credential();
    if let (Some(expected), Some(actual)) = (&config.team_id, &credential.team_id) {
        if expected != actual {
            warn!(expected = %expected, certificate = %actual, "certificate team differs from configured team");
        }
    }

    let resolver = ProfileResolver::new(config.profile.reconcile_policy);
    let profile = load_profile(config, &resolver)?;
    let requested = require_bundle_id(config)?;
    let reconciliation = resolver.reconcile(&profile, requested)?;

    let mut installed = None;
    if !no_install {
        let Some(password) = &config.keychain.password else {
            bail!("a keychain password is required to install the identity (--keychain-password)");
        };
        let store = CredentialStore::system(config.keychain.trusted_tools.clone());
        let keychain = Keychain::new(
            config.keychain.resolved_path(),
            SecretString::new(password.expose_secret().clone()),
        );
        let mut session = store.create_session(keychain)?;
        let report = store.install(&p12, session.keychain())?;
        // the exporter runs in a later process
        session.keep();
        installed = Some(json!({
            "keychain": session.keychain().path(),
            "strategy": report.strategy,
            "failed_attempts": report
                .failed_attempts
                .iter()
                .map(|(strategy, reason)| json!({ "strategy": strategy, "reason": reason }))
                .collect::<Vec<_>>(),
            "identity_visible": report.identity_visible,
        }));
    }

    let summary = json!({
        "credential": {
            "kind": credential.kind,
            "encryption": p12.encryption(),
            "common_name": credential.common_name,
            "team_id": credential.team_id,
            "sha1_fingerprint": credential.sha1_fingerprint,
            "not_after": credential.not_after,
        },
        "profile": profile_summary(&profile),
        "bundle_id": reconciliation.bundle_id,
        "reconciliation": reconciliation.note,
        "install": installed,
    });
    let text = serde_json::to_string_pretty(&summary)?;
    match out {
        Some(path) => {
            std::fs::write(path, format!("{text}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(out = %path.display(), "wrote credential summary");
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn build_export_options(config: &BuildConfig, out: &Path) -> anyhow::Result<()> {
    let resolver = ProfileResolver::new(config.profile.reconcile_policy);
    let profile = load_profile(config, &resolver)?;
    let bundle_id = require_bundle_id(config)?;
    let reconciliation = resolver.reconcile(&profile, bundle_id)?;
    let p12 = load_credential(config)?;

    let method = config
        .export
        .method
        .clone()
        .unwrap_or_else(|| profile.distribution_method.as_str().to_string());
    let options = ExportOptions::from(&config.export);
    let manifest = ExportConfigBuilder::build(
        &method,
        p12.as_ref().map(ValidatedP12::credential),
        &profile,
        &reconciliation.bundle_id,
        &options,
    );
    manifest.write(out)?;
    info!(out = %out.display(), method = %manifest.method, "wrote export options");
    Ok(())
}

fn load_credential(config: &BuildConfig) -> anyhow::Result<Option<ValidatedP12>> {
    let c = &config.credential;
    let input = match (&c.p12, &c.certificate, &c.private_key) {
        (Some(p12), _, _) => CredentialInput::P12 {
            label: p12.label(),
            bytes: p12.load(&config.retry)?,
            password: c
                .password
                .as_ref()
                .map(|p| SecretString::new(p.expose_secret().clone()))
                .unwrap_or_else(|| SecretString::new(String::new())),
        },
        (None, Some(certificate), Some(key)) => CredentialInput::CerKey {
            label: certificate.label(),
            certificate: certificate.load(&config.retry)?,
            private_key: key.load(&config.retry)?,
        },
        _ => return Ok(None),
    };
    Ok(Some(ingest(input)?))
}

fn load_profile(config: &BuildConfig, resolver: &ProfileResolver) -> anyhow::Result<ProvisioningProfile> {
    let Some(source) = &config.profile.source else {
        bail!("no provisioning profile given: pass --profile");
    };
    let bytes = source.load(&config.retry)?;
    Ok(resolver.resolve(&source.label(), &bytes)?)
}

fn require_bundle_id(config: &BuildConfig) -> anyhow::Result<&str> {
    match config.bundle_id.as_deref() {
        Some(id) => Ok(id),
        None => bail!("no bundle identifier given: pass --bundle-id"),
    }
}

fn profile_summary(profile: &ProvisioningProfile) -> serde_json::Value {
    json!({
        "uuid": profile.uuid,
        "name": profile.name,
        "team_id": profile.team_id,
        "team_name": profile.team_name,
        "entitled": profile.entitled_pattern.to_string(),
        "method": profile.distribution_method.as_str(),
        "expiry": profile.expiry.to_rfc3339(),
        "devices": profile.provisioned_devices,
    })
}
