//! Definer registry reconciliation.
//!
//! The registry document is the human-maintained inventory of privileged
//! functions. Reconciliation is a two-way set difference by function name
//! plus a declared-vs-observed check on sensitive-column access.

use crate::core::catalog::{CatalogState, FunctionDef};
use crate::core::config::GuardConfig;
use crate::core::error::GuardError;
use crate::core::finding::{Finding, Location, Report, Severity};
use crate::core::heuristics;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const RULE_UNREGISTERED: &str = "unregistered";
pub const RULE_POSSIBLY_REMOVED: &str = "possibly-removed";
pub const RULE_PII_MISMATCH: &str = "pii-mismatch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryEntry {
    pub purpose: String,
    pub pii_access: bool,
    pub justification: String,
    pub owner: String,
    /// ISO date the entry was added.
    pub added: String,
}

pub type Registry = BTreeMap<String, RegistryEntry>;

pub fn parse_registry(raw: &str) -> Result<Registry, GuardError> {
    serde_json::from_str(raw).map_err(|e| GuardError::Parse(format!("registry: {}", e)))
}

/// Read the registry document. In discover mode a missing file is an empty
/// registry; in enforcement mode it is fatal.
pub fn read_registry(path: &Path, discover: bool) -> Result<Registry, GuardError> {
    if !path.exists() {
        if discover {
            return Ok(Registry::new());
        }
        return Err(GuardError::NotFound(format!(
            "no registry at {}; run `rlsguard registry --discover` for scaffolds",
            path.display()
        )));
    }
    let raw = fs::read_to_string(path)?;
    parse_registry(&raw).map_err(|e| GuardError::Parse(format!("{}: {}", path.display(), e)))
}

/// Ready-to-paste registry entry for an unregistered function.
pub fn scaffold(function: &FunctionDef, config: &GuardConfig) -> serde_json::Value {
    let entry = RegistryEntry {
        purpose: String::new(),
        pii_access: heuristics::touches_sensitive(&function.body, config),
        justification: String::new(),
        owner: String::new(),
        added: crate::core::time::today(),
    };
    let mut object = serde_json::Map::new();
    object.insert(function.name.clone(), serde_json::json!(entry));
    serde_json::Value::Object(object)
}

pub fn reconcile(
    state: &CatalogState,
    registry: &Registry,
    config: &GuardConfig,
    discover: bool,
) -> Report {
    let mut report = Report::new("registry");
    report.enforcing = !discover;

    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for function in state.privileged_functions() {
        // overloads share one registry entry
        if !seen.insert(function.name.as_str()) {
            continue;
        }
        match registry.get(&function.name) {
            None => {
                let severity = if discover {
                    Severity::Info
                } else {
                    Severity::Error
                };
                report.push(
                    Finding::new(
                        RULE_UNREGISTERED,
                        severity,
                        format!("privileged function {} is not in the registry", function.name),
                    )
                    .at(Location::object(function.key())),
                );
                if discover {
                    report.notes.push(scaffold(function, config).to_string());
                }
            }
            Some(entry) => {
                let touches = heuristics::touches_sensitive(&function.body, config);
                if touches && !entry.pii_access && !heuristics::is_pii_allowlisted(&function.name, config) {
                    let columns = heuristics::sensitive_columns_in(
                        &function.body,
                        &config.schema.sensitive_columns,
                    );
                    report.push(
                        Finding::error(
                            RULE_PII_MISMATCH,
                            format!(
                                "{} reads {} but its registry entry declares pii_access=false",
                                function.name,
                                columns.join(", ")
                            ),
                        )
                        .at(Location::object(function.key()))
                        .change(Some("false".into()), Some("true".into())),
                    );
                }
            }
        }
    }

    for name in registry.keys() {
        if !seen.contains(name.as_str()) {
            report.push(Finding::warning(
                RULE_POSSIBLY_REMOVED,
                format!(
                    "registry entry {} has no live privileged function; confirm the drop before removing it",
                    name
                ),
            ));
        }
    }

    tracing::debug!(
        live = seen.len(),
        registered = registry.len(),
        findings = report.findings.len(),
        "registry reconciled"
    );
    report
}
