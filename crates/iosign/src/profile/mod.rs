//! Provisioning profile resolution.
//!
//! [`ProfileResolver::resolve`] opens the CMS envelope of a
//! `.mobileprovision`, reads the embedded plist and extracts the facts the
//! rest of the build depends on: UUID, team, entitled bundle id pattern,
//! expiry and distribution method.
//!
//! [`ProfileResolver::reconcile`] then decides the final main bundle id:
//!
//! | Entitlement | Requested id | Result |
//! |---|---|---|
//! | literal, equal | any | requested id, `NoCorrection` |
//! | literal, different | any | profile id, `AutoCorrected` (or error under [`ReconcilePolicy::Strict`]) |
//! | wildcard, prefix matches | any | requested id, `NoCorrection` |
//! | wildcard, no match | any | [`ProfileError::TeamMismatch`] |

pub mod cms;

use crate::config::ReconcilePolicy;
use crate::error::ProfileError;
use crate::export::DistributionMethod;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use plist::{Dictionary, Value};
use std::fmt;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Bundle id pattern granted by a profile's `application-identifier`, with
/// the `TEAMID.` prefix removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitledPattern {
    /// Exactly one bundle id.
    Literal(String),
    /// Every id starting with `prefix`. `TEAMID.*` has an empty prefix;
    /// `TEAMID.com.acme.*` has prefix `com.acme.`.
    Wildcard { prefix: String },
}

impl EntitledPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => EntitledPattern::Wildcard {
                prefix: prefix.to_string(),
            },
            None => EntitledPattern::Literal(pattern.to_string()),
        }
    }

    /// Whether `bundle_id` is covered. Comparison ignores ASCII case.
    pub fn matches(&self, bundle_id: &str) -> bool {
        match self {
            EntitledPattern::Literal(id) => id.eq_ignore_ascii_case(bundle_id),
            EntitledPattern::Wildcard { prefix } => {
                bundle_id.len() > prefix.len()
                    && bundle_id.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
            }
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, EntitledPattern::Wildcard { .. })
    }
}

impl fmt::Display for EntitledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntitledPattern::Literal(id) => f.write_str(id),
            EntitledPattern::Wildcard { prefix } => write!(f, "{}*", prefix),
        }
    }
}

/// Identity facts read from a provisioning profile.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    pub uuid: String,
    pub name: String,
    pub team_id: String,
    pub team_name: Option<String>,
    /// Prefix of `application-identifier`, normally equal to `team_id`.
    pub app_id_prefix: String,
    pub entitled_pattern: EntitledPattern,
    pub expiry: DateTime<Utc>,
    pub creation: Option<DateTime<Utc>>,
    pub distribution_method: DistributionMethod,
    pub provisioned_devices: usize,
    pub get_task_allow: bool,
    pub entitlements: Dictionary,
}

impl ProvisioningProfile {
    /// Whether the profile can sign `bundle_id`.
    pub fn covers(&self, bundle_id: &str) -> bool {
        self.entitled_pattern.matches(bundle_id)
    }
}

/// Outcome of [`ProfileResolver::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ReconcileNote {
    NoCorrection,
    AutoCorrected,
}

/// Final main bundle id after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub bundle_id: String,
    pub note: ReconcileNote,
}

/// Parses provisioning profiles and reconciles them with the requested id.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileResolver {
    policy: ReconcilePolicy,
}

impl ProfileResolver {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// Parse `bytes` and reject the profile if it has already expired.
    pub fn resolve(&self, label: &str, bytes: &[u8]) -> Result<ProvisioningProfile> {
        self.resolve_at(label, bytes, Utc::now())
    }

    /// [`resolve`](Self::resolve) against an explicit clock.
    pub fn resolve_at(&self, label: &str, bytes: &[u8], now: DateTime<Utc>) -> Result<ProvisioningProfile> {
        let content = cms::open_envelope(bytes).map_err(|reason| unparseable(label, reason))?;
        let profile = parse_profile(label, &content)?;

        if profile.expiry <= now {
            return Err(ProfileError::Expired {
                uuid: profile.uuid,
                name: profile.name,
                expired_at: profile.expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
            }
            .into());
        }

        info!(
            uuid = %profile.uuid,
            name = %profile.name,
            team = %profile.team_id,
            pattern = %profile.entitled_pattern,
            method = %profile.distribution_method,
            "resolved provisioning profile"
        );
        Ok(profile)
    }

    /// Decide the final main bundle id for `requested`.
    pub fn reconcile(&self, profile: &ProvisioningProfile, requested: &str) -> Result<Reconciliation> {
        match &profile.entitled_pattern {
            EntitledPattern::Literal(entitled) if entitled.eq_ignore_ascii_case(requested) => {
                Ok(Reconciliation {
                    bundle_id: requested.to_string(),
                    note: ReconcileNote::NoCorrection,
                })
            }
            EntitledPattern::Literal(entitled) => match self.policy {
                ReconcilePolicy::ProfileWins => {
                    warn!(
                        uuid = %profile.uuid,
                        requested,
                        entitled = %entitled,
                        "bundle id does not match provisioning profile, using the profile's id"
                    );
                    Ok(Reconciliation {
                        bundle_id: entitled.clone(),
                        note: ReconcileNote::AutoCorrected,
                    })
                }
                ReconcilePolicy::Strict => Err(team_mismatch(profile, requested)),
            },
            pattern @ EntitledPattern::Wildcard { .. } => {
                if pattern.matches(requested) {
                    debug!(uuid = %profile.uuid, requested, pattern = %pattern, "wildcard profile covers bundle id");
                    Ok(Reconciliation {
                        bundle_id: requested.to_string(),
                        note: ReconcileNote::NoCorrection,
                    })
                } else {
                    Err(team_mismatch(profile, requested))
                }
            }
        }
    }
}

fn team_mismatch(profile: &ProvisioningProfile, requested: &str) -> crate::Error {
    ProfileError::TeamMismatch {
        uuid: profile.uuid.clone(),
        entitled: profile.entitled_pattern.to_string(),
        requested: requested.to_string(),
    }
    .into()
}

fn unparseable(label: &str, reason: impl Into<String>) -> crate::Error {
    ProfileError::Unparseable {
        input: label.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn parse_profile(label: &str, content: &[u8]) -> Result<ProvisioningProfile> {
    let root: Dictionary = plist::from_bytes(content)
        .map_err(|e| unparseable(label, format!("embedded plist: {}", e)))?;

    let string = |key: &str| root.get(key).and_then(Value::as_string).map(str::to_string);
    let date = |key: &str| root.get(key).and_then(Value::as_date).map(to_utc);

    let uuid = string("UUID").ok_or_else(|| unparseable(label, "missing UUID"))?;
    let name = string("Name").unwrap_or_default();
    let expiry = date("ExpirationDate").ok_or_else(|| unparseable(label, "missing ExpirationDate"))?;

    let entitlements = root
        .get("Entitlements")
        .and_then(Value::as_dictionary)
        .cloned()
        .ok_or_else(|| unparseable(label, "missing Entitlements"))?;

    let app_identifier = entitlements
        .get("application-identifier")
        .and_then(Value::as_string)
        .ok_or_else(|| unparseable(label, "missing application-identifier entitlement"))?;
    let (app_id_prefix, pattern) = app_identifier
        .split_once('.')
        .ok_or_else(|| unparseable(label, format!("malformed application-identifier `{}`", app_identifier)))?;

    let team_id = entitlements
        .get("com.apple.developer.team-identifier")
        .and_then(Value::as_string)
        .map(str::to_string)
        .or_else(|| {
            root.get("TeamIdentifier")
                .and_then(Value::as_array)
                .and_then(|ids| ids.first())
                .and_then(Value::as_string)
                .map(str::to_string)
        })
        .unwrap_or_else(|| app_id_prefix.to_string());

    let get_task_allow = entitlements
        .get("get-task-allow")
        .and_then(Value::as_boolean)
        .unwrap_or(false);
    let devices = root.get("ProvisionedDevices").and_then(Value::as_array);
    let all_devices = root
        .get("ProvisionsAllDevices")
        .and_then(Value::as_boolean)
        .unwrap_or(false);

    let distribution_method = match (all_devices, devices.is_some(), get_task_allow) {
        (true, _, _) => DistributionMethod::Enterprise,
        (false, true, true) => DistributionMethod::Development,
        (false, true, false) => DistributionMethod::AdHoc,
        (false, false, _) => DistributionMethod::AppStore,
    };

    Ok(ProvisioningProfile {
        uuid,
        name,
        team_name: string("TeamName"),
        app_id_prefix: app_id_prefix.to_string(),
        entitled_pattern: EntitledPattern::parse(pattern),
        team_id,
        expiry,
        creation: date("CreationDate"),
        distribution_method,
        provisioned_devices: devices.map_or(0, Vec::len),
        get_task_allow,
        entitlements,
    })
}

fn to_utc(date: plist::Date) -> DateTime<Utc> {
    DateTime::<Utc>::from(SystemTime::from(date))
}
