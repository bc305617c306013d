//! Security Invariant Checker: a fixed battery of live-state assertions.
//!
//! The catalog is loaded once (a failure there is tool-fatal). Each invariant
//! is then an independent function over the loaded state; an invariant that
//! errors is recorded as a failed check with the cause attached and the
//! battery carries on.

use crate::core::catalog::{self, CatalogState, FunctionDef, PolicyDefinition};
use crate::core::config::GuardConfig;
use crate::core::error::GuardError;
use crate::core::finding::{CheckOutcome, Finding, Location, Report};
use crate::core::heuristics::{self, Gate};
use regex::Regex;
use sqlx::PgPool;
use std::time::Instant;

pub type CheckFn = fn(&CatalogState, &GuardConfig) -> Result<Vec<Finding>, GuardError>;

pub struct Invariant {
    pub id: &'static str,
    pub title: &'static str,
    pub check: CheckFn,
}

/// The battery, in execution order.
pub fn battery() -> Vec<Invariant> {
    vec![
        Invariant {
            id: "identity-table-select-identity",
            title: "SELECT policies on the identity table gate on the caller",
            check: identity_table_select_identity,
        },
        Invariant {
            id: "public-directory-functions",
            title: "public directory lookup procedures exist",
            check: public_directory_functions,
        },
        Invariant {
            id: "profile-json-contact-leak",
            title: "profile JSON builders do not embed contact fields",
            check: profile_json_contact_leak,
        },
        Invariant {
            id: "secret-tables-locked",
            title: "one-time-code and diagnostic tables are unreadable",
            check: secret_tables_locked,
        },
        Invariant {
            id: "no-readable-code-generators",
            title: "no one-time-code generator returns its code",
            check: no_readable_code_generators,
        },
        Invariant {
            id: "rekey-lock-and-duplicate-check",
            title: "identity re-key procedures lock and check duplicates",
            check: rekey_lock_and_duplicate_check,
        },
        Invariant {
            id: "no-true-select-policies",
            title: "no SELECT policy is unconditionally true",
            check: no_true_select_policies,
        },
        Invariant {
            id: "sensitive-table-identity",
            title: "policies on sensitive tables gate on the caller",
            check: sensitive_table_identity,
        },
        Invariant {
            id: "definer-search-path",
            title: "security definer functions pin search_path",
            check: definer_search_path,
        },
        Invariant {
            id: "trigger-tenancy-rewrite",
            title: "triggers do not rewrite tenancy columns",
            check: trigger_tenancy_rewrite,
        },
        Invariant {
            id: "definer-tenancy-rewrite",
            title: "definer functions do not re-scope rows to another tenant",
            check: definer_tenancy_rewrite,
        },
        Invariant {
            id: "merge-lock-and-duplicate-check",
            title: "account merge procedures lock and check duplicates",
            check: merge_lock_and_duplicate_check,
        },
        Invariant {
            id: "bounded-aggregation",
            title: "definer aggregations are capped",
            check: bounded_aggregation,
        },
        Invariant {
            id: "policy-audit",
            title: "full SELECT policy audit",
            check: policy_audit,
        },
        Invariant {
            id: "rls-enabled",
            title: "row level security enabled on every governed table",
            check: rls_enabled,
        },
    ]
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, GuardError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| GuardError::Config(format!("invalid pattern {:?}: {}", p, e)))
        })
        .collect()
}

fn policy_location(policy: &PolicyDefinition) -> Location {
    Location::object(policy.key())
}

fn function_location(function: &FunctionDef) -> Location {
    Location::object(function.key())
}

/// Predicate that decides visibility (SELECT/UPDATE/DELETE/ALL) or admission (INSERT).
fn governing_expr(policy: &PolicyDefinition) -> Option<&str> {
    if policy.command == "insert" {
        policy.with_check.as_deref()
    } else {
        policy.using.as_deref().or(policy.with_check.as_deref())
    }
}

fn identity_table_select_identity(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let table = &config.schema.identity_table;
    if state.table(table).is_none() {
        return Err(GuardError::NotFound(format!("identity table {}", table)));
    }
    let mut findings = Vec::new();
    for policy in state.policies_on(table).filter(|p| p.governs_select()) {
        let gate = heuristics::classify_gate(policy.using.as_deref(), config);
        if !gate.is_isolating() {
            findings.push(
                Finding::error(
                    "identity-table-select-identity",
                    format!(
                        "SELECT policy \"{}\" on {} does not check the caller's identity",
                        policy.name, table
                    ),
                )
                .at(policy_location(policy))
                .change(policy.using.clone(), None),
            );
        }
    }
    Ok(findings)
}

fn public_directory_functions(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    Ok(config
        .heuristics
        .public_directory_functions
        .iter()
        .filter(|name| state.functions_named(name).next().is_none())
        .map(|name| {
            Finding::error(
                "public-directory-functions",
                format!(
                    "public directory procedure {} is missing; public reads would need direct table access",
                    name
                ),
            )
        })
        .collect())
}

fn profile_json_contact_leak(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let pattern = Regex::new(&config.heuristics.profile_function_pattern)
        .map_err(|e| GuardError::Config(e.to_string()))?;
    let mut findings = Vec::new();
    for function in &state.functions {
        if !pattern.is_match(&function.name)
            || heuristics::is_pii_allowlisted(&function.name, config)
            || !heuristics::builds_json(&function.body)
        {
            continue;
        }
        let leaked = heuristics::sensitive_columns_in(&function.body, &config.schema.contact_columns);
        if !leaked.is_empty() {
            findings.push(
                Finding::error(
                    "profile-json-contact-leak",
                    format!(
                        "{} builds a profile response that includes {}",
                        function.name,
                        leaked.join(", ")
                    ),
                )
                .at(function_location(function)),
            );
        }
    }
    Ok(findings)
}

fn secret_tables_locked(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let mut findings = Vec::new();
    for table in &config.schema.secret_tables {
        let Some(rls) = state.table(table) else {
            findings.push(Finding::info(
                "secret-tables-locked",
                format!("secret table {} not present", table),
            ));
            continue;
        };
        if !rls.rls_enabled {
            findings.push(
                Finding::error(
                    "secret-tables-locked",
                    format!("secret table {} has row level security disabled", table),
                )
                .at(Location::object(rls.key())),
            );
        }
        for policy in state.policies_on(table).filter(|p| p.governs_select()) {
            // admin helpers usually take auth.uid() as input, so test for them directly
            let locked = match policy.using.as_deref() {
                Some(expr) => {
                    heuristics::is_explicit_deny(expr) || heuristics::is_admin_gate(expr, config)
                }
                None => false,
            };
            if !locked {
                findings.push(
                    Finding::error(
                        "secret-tables-locked",
                        format!(
                            "secret table {} is readable through policy \"{}\"",
                            table, policy.name
                        ),
                    )
                    .at(policy_location(policy))
                    .change(policy.using.clone(), None),
                );
            }
        }
    }
    Ok(findings)
}

fn no_readable_code_generators(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let patterns = compile(&config.heuristics.forbidden_function_patterns)?;
    Ok(state
        .functions
        .iter()
        .filter(|f| patterns.iter().any(|re| re.is_match(&f.name)) && f.returns_value())
        .map(|f| {
            Finding::error(
                "no-readable-code-generators",
                format!(
                    "{} returns {}; one-time codes must never be retrievable",
                    f.name,
                    f.returns.as_deref().unwrap_or("a value")
                ),
            )
            .at(function_location(f))
        })
        .collect())
}

fn lock_and_duplicate_findings(
    rule: &str,
    patterns: &[String],
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let patterns = compile(patterns)?;
    let mut findings = Vec::new();
    for function in state
        .functions
        .iter()
        .filter(|f| patterns.iter().any(|re| re.is_match(&f.name)))
    {
        if !heuristics::takes_advisory_xact_lock(&function.body) {
            findings.push(
                Finding::error(
                    rule,
                    format!(
                        "{} does not take a transaction-scoped advisory lock",
                        function.name
                    ),
                )
                .at(function_location(function)),
            );
        }
        let missing = heuristics::missing_duplicate_checks(
            &function.body,
            &config.heuristics.identity_locations,
        );
        if !missing.is_empty() {
            findings.push(
                Finding::error(
                    rule,
                    format!(
                        "{} does not check for duplicates in {}",
                        function.name,
                        missing.join(", ")
                    ),
                )
                .at(function_location(function)),
            );
        }
    }
    Ok(findings)
}

fn rekey_lock_and_duplicate_check(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    lock_and_duplicate_findings(
        "rekey-lock-and-duplicate-check",
        &config.heuristics.rekey_function_patterns,
        state,
        config,
    )
}

fn merge_lock_and_duplicate_check(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    lock_and_duplicate_findings(
        "merge-lock-and-duplicate-check",
        &config.heuristics.merge_function_patterns,
        state,
        config,
    )
}

fn no_true_select_policies(
    state: &CatalogState,
    _config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    Ok(state
        .policies
        .iter()
        .filter(|p| p.governs_select())
        .filter(|p| p.using.as_deref().is_some_and(heuristics::is_unconditional_true))
        .map(|p| {
            Finding::error(
                "no-true-select-policies",
                format!("policy \"{}\" on {} is USING (true)", p.name, p.table),
            )
            .at(policy_location(p))
        })
        .collect())
}

fn sensitive_table_identity(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let mut findings = Vec::new();
    for table in &config.schema.sensitive_tables {
        for policy in state.policies_on(table) {
            let expr = governing_expr(policy);
            let gate = heuristics::classify_gate(expr, config);
            if !gate.is_isolating() {
                findings.push(
                    Finding::error(
                        "sensitive-table-identity",
                        format!(
                            "{} policy \"{}\" on sensitive table {} does not reference the caller",
                            policy.command.to_uppercase(),
                            policy.name,
                            table
                        ),
                    )
                    .at(policy_location(policy))
                    .change(expr.map(str::to_string), None),
                );
            }
        }
    }
    Ok(findings)
}

fn definer_search_path(
    state: &CatalogState,
    _config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let mut findings = Vec::new();
    for function in state.privileged_functions() {
        if !function.sets_search_path() {
            findings.push(
                Finding::error(
                    "definer-search-path",
                    format!("{} runs as definer without a pinned search_path", function.name),
                )
                .at(function_location(function)),
            );
        }
        if heuristics::has_select_star(&function.body) {
            findings.push(
                Finding::warning(
                    "definer-search-path",
                    format!("{} projects full rows (SELECT *)", function.name),
                )
                .at(function_location(function)),
            );
        }
    }
    Ok(findings)
}

fn trigger_tenancy_rewrite(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let mut findings = Vec::new();
    for trigger in &state.triggers {
        let columns =
            heuristics::assigned_new_columns(&trigger.function_body, &config.schema.immutable_columns);
        if !columns.is_empty() {
            findings.push(
                Finding::error(
                    "trigger-tenancy-rewrite",
                    format!(
                        "trigger {} on {} ({}) silently assigns {}",
                        trigger.name,
                        trigger.table,
                        trigger.function_name,
                        columns.join(", ")
                    ),
                )
                .at(Location::object(format!(
                    "{}.{}.{}",
                    trigger.schema, trigger.table, trigger.name
                ))),
            );
        }
    }
    Ok(findings)
}

fn definer_tenancy_rewrite(
    state: &CatalogState,
    config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    let exempt = compile(
        &config
            .heuristics
            .merge_function_patterns
            .iter()
            .chain(&config.heuristics.rekey_function_patterns)
            .cloned()
            .collect::<Vec<_>>(),
    )?;
    let mut findings = Vec::new();
    for function in state.privileged_functions() {
        if exempt.iter().any(|re| re.is_match(&function.name))
            || heuristics::is_pii_allowlisted(&function.name, config)
        {
            continue;
        }
        let columns = heuristics::updated_columns(&function.body, &config.schema.immutable_columns);
        if !columns.is_empty() {
            findings.push(
                Finding::error(
                    "definer-tenancy-rewrite",
                    format!(
                        "{} rewrites tenancy column(s) {} with definer privileges",
                        function.name,
                        columns.join(", ")
                    ),
                )
                .at(function_location(function)),
            );
        }
    }
    Ok(findings)
}

fn bounded_aggregation(
    state: &CatalogState,
    _config: &GuardConfig,
) -> Result<Vec<Finding>, GuardError> {
    Ok(state
        .privileged_functions()
        .filter(|f| heuristics::aggregates_unbounded(&f.body))
        .map(|f| {
            Finding::error(
                "bounded-aggregation",
                format!("{} aggregates rows without a LIMIT", f.name),
            )
            .at(function_location(f))
        })
        .collect())
}

fn policy_audit(state: &CatalogState, config: &GuardConfig) -> Result<Vec<Finding>, GuardError> {
    let mut findings = Vec::new();
    for policy in state.policies.iter().filter(|p| p.governs_select()) {
        let gate = heuristics::classify_gate(policy.using.as_deref(), config);
        let critical = config.schema.critical_tables.contains(&policy.table);
        let finding = match gate {
            Gate::Unconditional => Finding::error(
                "policy-audit",
                format!("\"{}\" on {} is unconditionally true", policy.name, policy.table),
            ),
            Gate::Ungated if critical => Finding::error(
                "policy-audit",
                format!(
                    "\"{}\" on critical table {} has no identity, deny or admin gate",
                    policy.name, policy.table
                ),
            ),
            Gate::Ungated => Finding::warning(
                "policy-audit",
                format!(
                    "\"{}\" on {} has no identity, deny or admin gate",
                    policy.name, policy.table
                ),
            ),
            _ => continue,
        };
        findings.push(
            finding
                .at(policy_location(policy))
                .change(policy.using.clone(), None),
        );
    }
    Ok(findings)
}

fn rls_enabled(state: &CatalogState, _config: &GuardConfig) -> Result<Vec<Finding>, GuardError> {
    Ok(state
        .tables
        .iter()
        .filter(|t| !t.rls_enabled)
        .map(|t| {
            Finding::error(
                "rls-enabled",
                format!("table {} has row level security disabled", t.key()),
            )
            .at(Location::object(t.key()))
        })
        .collect())
}

/// Run every invariant against an already-loaded catalog.
pub fn run_battery(state: &CatalogState, config: &GuardConfig) -> Report {
    let mut report = Report::new("invariants");
    for invariant in battery() {
        let started = Instant::now();
        let outcome = match (invariant.check)(state, config) {
            Ok(findings) => CheckOutcome::from_findings(invariant.id, invariant.title, findings),
            Err(err) => {
                tracing::warn!(invariant = invariant.id, error = %err, "invariant errored");
                CheckOutcome::errored(invariant.id, invariant.title, err)
            }
        };
        tracing::debug!(
            invariant = invariant.id,
            status = ?outcome.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "invariant finished"
        );
        report.push_check(outcome);
    }
    report
}

pub async fn run_invariants(pool: &PgPool, config: &GuardConfig) -> Result<Report, GuardError> {
    let state = catalog::load(pool, &config.schema.schemas).await?;
    Ok(run_battery(&state, config))
}
