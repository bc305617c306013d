//! Policy/function snapshot and drift detection.
//!
//! A [`Snapshot`] reduces every policy and privileged function to a hash of
//! its token-normalized text, so reformatting or comment edits never register
//! as drift. The baseline document is an explicit artifact: written only by
//! `drift --snapshot`, read by every compare run.

use crate::core::catalog::{CatalogState, FunctionDef, PolicyDefinition};
use crate::core::error::GuardError;
use crate::core::finding::{Finding, Location, Report};
use crate::core::sqlscan::normalize_fragment;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlsFlags {
    pub enabled: bool,
    pub forced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub policies: usize,
    pub functions: usize,
    pub tables: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub version: u32,
    pub generated_at: String,
    pub run_id: String,
    pub summary: SnapshotSummary,
    pub policies: BTreeMap<String, String>,
    pub functions: BTreeMap<String, String>,
    pub rls: BTreeMap<String, RlsFlags>,
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("sha256:{:x}", hasher.finalize())
}

fn normalized(text: Option<&str>) -> String {
    text.map(normalize_fragment).unwrap_or_default()
}

pub fn policy_hash(policy: &PolicyDefinition) -> String {
    let mut roles = policy.roles.clone();
    roles.sort();
    digest(&[
        &policy.command.to_ascii_lowercase(),
        if policy.permissive { "permissive" } else { "restrictive" },
        &roles.join(","),
        &normalized(policy.using.as_deref()),
        &normalized(policy.with_check.as_deref()),
    ])
}

pub fn function_hash(function: &FunctionDef) -> String {
    let mut config = function.config.clone();
    config.sort();
    digest(&[
        &normalize_fragment(&function.args),
        &normalized(function.returns.as_deref()),
        &config.join(","),
        &normalize_fragment(&function.body),
    ])
}

impl Snapshot {
    pub fn from_catalog(state: &CatalogState) -> Self {
        let policies: BTreeMap<_, _> = state
            .policies
            .iter()
            .map(|p| (p.key(), policy_hash(p)))
            .collect();
        let functions: BTreeMap<_, _> = state
            .privileged_functions()
            .map(|f| (f.key(), function_hash(f)))
            .collect();
        let rls: BTreeMap<_, _> = state
            .tables
            .iter()
            .map(|t| {
                (
                    t.key(),
                    RlsFlags {
                        enabled: t.rls_enabled,
                        forced: t.rls_forced,
                    },
                )
            })
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            generated_at: crate::core::time::now_rfc3339(),
            run_id: crate::core::time::new_run_id(),
            summary: SnapshotSummary {
                policies: policies.len(),
                functions: functions.len(),
                tables: rls.len(),
            },
            policies,
            functions,
            rls,
        }
    }
}

pub fn read_baseline(path: &Path) -> Result<Snapshot, GuardError> {
    if !path.exists() {
        return Err(GuardError::NotFound(format!(
            "no baseline at {}; run `rlsguard drift --snapshot` to create one",
            path.display()
        )));
    }
    let raw = fs::read_to_string(path)?;
    let snapshot: Snapshot = serde_json::from_str(&raw)
        .map_err(|e| GuardError::Parse(format!("{}: {}", path.display(), e)))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(GuardError::Parse(format!(
            "{}: snapshot version {} is not supported (expected {}); re-run `rlsguard drift --snapshot`",
            path.display(),
            snapshot.version,
            SNAPSHOT_VERSION
        )));
    }
    Ok(snapshot)
}

/// Persist `snapshot` as the new baseline, overwriting any prior one.
pub fn write_baseline(path: &Path, snapshot: &Snapshot) -> Result<Report, GuardError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(snapshot)?;
    body.push('\n');
    fs::write(path, body)?;
    tracing::info!(path = %path.display(), "baseline written");

    let mut report = Report::new("drift");
    report.enforcing = false;
    report.notes.push(format!(
        "drift: baseline written to {} ({} policies, {} functions, {} tables)",
        path.display(),
        snapshot.summary.policies,
        snapshot.summary.functions,
        snapshot.summary.tables
    ));
    Ok(report)
}

fn diff_hashes(
    kind: &str,
    baseline: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
    findings: &mut Vec<Finding>,
) {
    for (key, old) in baseline {
        match current.get(key) {
            None => findings.push(
                Finding::error(
                    &format!("{}-removed", kind),
                    format!("{} {} is in the baseline but no longer live", kind, key),
                )
                .at(Location::object(key.clone()))
                .change(Some(old.clone()), None),
            ),
            Some(new) if new != old => findings.push(
                Finding::warning(
                    &format!("{}-changed", kind),
                    format!("{} {} changed since the baseline; review it", kind, key),
                )
                .at(Location::object(key.clone()))
                .change(Some(old.clone()), Some(new.clone())),
            ),
            Some(_) => {}
        }
    }
    for (key, new) in current {
        if !baseline.contains_key(key) {
            findings.push(
                Finding::info(
                    &format!("{}-added", kind),
                    format!("{} {} is new since the baseline", kind, key),
                )
                .at(Location::object(key.clone()))
                .change(None, Some(new.clone())),
            );
        }
    }
}

fn flag(value: bool) -> Option<String> {
    Some(value.to_string())
}

fn diff_rls(
    baseline: &BTreeMap<String, RlsFlags>,
    current: &BTreeMap<String, RlsFlags>,
    findings: &mut Vec<Finding>,
) {
    for (table, old) in baseline {
        let Some(new) = current.get(table) else {
            findings.push(
                Finding::warning(
                    "table-removed",
                    format!("table {} is in the baseline but no longer live", table),
                )
                .at(Location::object(table.clone())),
            );
            continue;
        };
        if old.enabled && !new.enabled {
            findings.push(
                Finding::error(
                    "rls-disabled",
                    format!("row level security was disabled on {}", table),
                )
                .at(Location::object(table.clone()))
                .change(flag(old.enabled), flag(new.enabled)),
            );
        }
        if old.forced && !new.forced {
            findings.push(
                Finding::error(
                    "rls-force-removed",
                    format!("FORCE ROW LEVEL SECURITY was removed from {}", table),
                )
                .at(Location::object(table.clone()))
                .change(flag(old.forced), flag(new.forced)),
            );
        }
        if (!old.enabled && new.enabled) || (!old.forced && new.forced) {
            findings.push(
                Finding::info(
                    "rls-tightened",
                    format!("row level security flags tightened on {}", table),
                )
                .at(Location::object(table.clone())),
            );
        }
    }
    for (table, new) in current {
        if baseline.contains_key(table) {
            continue;
        }
        let finding = if new.enabled {
            Finding::info("table-added", format!("table {} is new since the baseline", table))
        } else {
            Finding::warning(
                "table-added-without-rls",
                format!("new table {} does not have row level security enabled", table),
            )
        };
        findings.push(finding.at(Location::object(table.clone())));
    }
}

/// Categorized differences between a baseline and a fresh snapshot.
pub fn diff(baseline: &Snapshot, current: &Snapshot) -> Vec<Finding> {
    let mut findings = Vec::new();
    diff_rls(&baseline.rls, &current.rls, &mut findings);
    diff_hashes("policy", &baseline.policies, &current.policies, &mut findings);
    diff_hashes("function", &baseline.functions, &current.functions, &mut findings);
    findings
}

pub fn compare(baseline: &Snapshot, state: &CatalogState) -> Report {
    let current = Snapshot::from_catalog(state);
    let mut report = Report::new("drift");
    report.extend(diff(baseline, &current));
    report.notes.push(format!(
        "drift: compared against baseline {} ({}); {} difference(s)",
        baseline.run_id,
        baseline.generated_at,
        report.findings.len()
    ));
    report
}
