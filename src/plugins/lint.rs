//! Migration Linter: static analysis of migration scripts for dangerous
//! security patterns.
//!
//! Each script is tokenized once and split into statements. Pattern rules run
//! over a statement's normalized text; structural rules run over extracted
//! function blocks and the script's policy/table statements, so a search path
//! set in one function can never satisfy the check for another.

use crate::core::config::GuardConfig;
use crate::core::error::GuardError;
use crate::core::finding::{Finding, Location, Report, Severity};
use crate::core::heuristics;
use crate::core::sqlscan::{self, FunctionBlock, QualifiedName, Statement, StatementKind};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

pub const RULE_POLICY_USING_TRUE: &str = "policy-using-true";
pub const RULE_GRANT_ALL: &str = "grant-all";
pub const RULE_DISABLE_RLS: &str = "disable-rls";
pub const RULE_GRANT_EXECUTE_ANON: &str = "grant-execute-anon";
pub const RULE_DEFINER_RETURNS_ROWS: &str = "definer-returns-table-rows";
pub const RULE_SET_ROLE: &str = "set-role";
pub const RULE_DEFINER_SEARCH_PATH: &str = "definer-search-path";
pub const RULE_DEFINER_SELECT_STAR: &str = "definer-select-star";
pub const RULE_DROP_WITHOUT_REPLACEMENT: &str = "drop-policy-without-replacement";
pub const RULE_TABLE_WITHOUT_RLS: &str = "table-without-rls";
pub const RULE_PARSE_ERROR: &str = "parse-error";

/// One timestamp-ordered unit of schema change text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub id: String,
    pub text: String,
}

impl MigrationScript {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, GuardError> {
        let text = fs::read_to_string(path)?;
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { id, text })
    }
}

/// Which scripts to lint. The rule set is the same for every selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSelection {
    Corpus,
    Staged,
    Files(Vec<PathBuf>),
}

struct PatternRule {
    id: &'static str,
    severity: Severity,
    regex: Regex,
    message: &'static str,
}

static PATTERN_RULES: LazyLock<Vec<PatternRule>> = LazyLock::new(|| {
    let rule = |id, severity, pattern: &str, message| PatternRule {
        id,
        severity,
        regex: Regex::new(pattern).expect("valid lint pattern"),
        message,
    };
    vec![
        rule(
            RULE_GRANT_ALL,
            Severity::Error,
            r"^grant all( privileges)? on .+ to (?P<grantees>.+)$",
            "GRANT ALL to a client-facing role bypasses least privilege",
        ),
        rule(
            RULE_DISABLE_RLS,
            Severity::Error,
            r"^alter table .+ disable row level security",
            "row level security disabled unconditionally",
        ),
        rule(
            RULE_DISABLE_RLS,
            Severity::Warning,
            r"^alter table .+ no force row level security",
            "FORCE ROW LEVEL SECURITY removed; table owner bypasses policies",
        ),
        rule(
            RULE_GRANT_EXECUTE_ANON,
            Severity::Error,
            r"^grant execute on (function|routine|all functions in schema|all routines in schema) .+ to (?P<grantees>.+)$",
            "function execution granted to an unauthenticated role",
        ),
        rule(
            RULE_SET_ROLE,
            Severity::Warning,
            r"^set( local| session)? role ",
            "SET ROLE inside a migration changes the privileges of later statements",
        ),
    ]
});

/// Roles whose grants a pattern rule considers client-facing.
fn rule_roles(rule_id: &str) -> &'static [&'static str] {
    match rule_id {
        RULE_GRANT_ALL => &["anon", "authenticated", "public"],
        RULE_GRANT_EXECUTE_ANON => &["anon", "public"],
        _ => &[],
    }
}

fn grantees(list: &str) -> Vec<String> {
    list.trim_end_matches(" with grant option")
        .split(',')
        .map(|g| {
            g.trim()
                .trim_start_matches("group ")
                .trim()
                .trim_matches('"')
                .to_string()
        })
        .filter(|g| !g.is_empty())
        .collect()
}

const SCALAR_TYPES: &[&str] = &[
    "record", "text", "uuid", "integer", "int", "int2", "int4", "int8", "bigint", "smallint",
    "boolean", "bool", "json", "jsonb", "numeric", "varchar", "character", "timestamptz",
    "timestamp", "date", "bytea", "real", "double", "precision", "float4", "float8", "name",
];

fn returns_table_rows(block: &FunctionBlock) -> Option<String> {
    let rest = block.returns.strip_prefix("setof ")?;
    let type_name = rest.rsplit(' ').next()?.trim_matches('"');
    if SCALAR_TYPES.contains(&type_name) || rest.ends_with(']') {
        None
    } else {
        Some(rest.replace(" . ", "."))
    }
}

fn same_relation(a: &QualifiedName, b: &QualifiedName) -> bool {
    a.name == b.name
        && match (&a.schema, &b.schema) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        }
}

struct Classified {
    statement: Statement,
    kind: StatementKind,
}

/// Lint a single script. Never mutates the input; same text, same findings.
pub fn lint_script(script: &MigrationScript, config: &GuardConfig) -> Vec<Finding> {
    let statements = match sqlscan::parse_statements(&script.text) {
        Ok(statements) => statements,
        Err(err) => {
            return vec![
                Finding::error(RULE_PARSE_ERROR, format!("could not tokenize script: {}", err))
                    .at(Location::object(script.id.clone())),
            ];
        }
    };
    let classified: Vec<Classified> = statements
        .into_iter()
        .map(|statement| {
            let kind = sqlscan::classify(&statement);
            Classified { statement, kind }
        })
        .collect();

    let mut findings = Vec::new();
    pattern_rules(script, &classified, &mut findings);
    function_rules(script, &classified, &mut findings);
    drop_policy_rule(script, &classified, &mut findings);
    table_rls_rule(script, &classified, config, &mut findings);

    findings.sort_by(|a, b| {
        let line = |f: &Finding| f.location.as_ref().and_then(|l| l.line).unwrap_or(0);
        line(a).cmp(&line(b)).then_with(|| a.rule.cmp(&b.rule))
    });
    findings
}

fn pattern_rules(script: &MigrationScript, classified: &[Classified], out: &mut Vec<Finding>) {
    for item in classified {
        let location = Location::file(script.id.clone(), item.statement.line);

        if let StatementKind::CreatePolicy(policy) = &item.kind {
            if let Some(using) = &policy.using {
                if heuristics::is_unconditional_true(using) {
                    let severity = match policy.command.as_str() {
                        "select" | "all" => Some(Severity::Error),
                        "update" | "delete" => Some(Severity::Warning),
                        _ => None,
                    };
                    if let Some(severity) = severity {
                        out.push(
                            Finding::new(
                                RULE_POLICY_USING_TRUE,
                                severity,
                                format!(
                                    "policy \"{}\" on {} ({}) is USING (true): every row is visible to {}",
                                    policy.name,
                                    policy.table.display(),
                                    policy.command.to_uppercase(),
                                    if policy.roles.is_empty() {
                                        "public".to_string()
                                    } else {
                                        policy.roles.join(", ")
                                    }
                                ),
                            )
                            .at(location.clone()),
                        );
                    }
                }
            }
        }

        if let StatementKind::CreateFunction(block) = &item.kind {
            if block.security_definer {
                if let Some(relation) = returns_table_rows(block) {
                    out.push(
                        Finding::error(
                            RULE_DEFINER_RETURNS_ROWS,
                            format!(
                                "security definer function {} returns full rows of {}; enumerate columns instead",
                                block.name.display(),
                                relation
                            ),
                        )
                        .at(location.clone()),
                    );
                }
            }
            continue;
        }

        let normalized = item.statement.normalized();
        for rule in PATTERN_RULES.iter() {
            let Some(caps) = rule.regex.captures(&normalized) else {
                continue;
            };
            let roles = rule_roles(rule.id);
            let offending: Vec<String> = match caps.name("grantees") {
                Some(list) => grantees(list.as_str())
                    .into_iter()
                    .filter(|g| roles.contains(&g.as_str()))
                    .collect(),
                None => Vec::new(),
            };
            if !roles.is_empty() && offending.is_empty() {
                continue;
            }
            let message = if offending.is_empty() {
                rule.message.to_string()
            } else {
                format!("{} ({})", rule.message, offending.join(", "))
            };
            out.push(Finding::new(rule.id, rule.severity, message).at(location.clone()));
        }
    }
}

fn function_rules(script: &MigrationScript, classified: &[Classified], out: &mut Vec<Finding>) {
    let altered_with_search_path: Vec<&QualifiedName> = classified
        .iter()
        .filter_map(|item| match &item.kind {
            StatementKind::AlterFunctionSet { name, params }
                if params.iter().any(|p| p == "search_path") =>
            {
                Some(name)
            }
            _ => None,
        })
        .collect();

    for item in classified {
        let StatementKind::CreateFunction(block) = &item.kind else {
            continue;
        };
        if !block.security_definer {
            continue;
        }
        let body = block.body.as_deref().unwrap_or("");

        let sets_path = block.set_params.iter().any(|p| p == "search_path")
            || heuristics::body_sets_search_path(body)
            || altered_with_search_path
                .iter()
                .any(|name| same_relation(name, &block.name));
        if !sets_path {
            out.push(
                Finding::error(
                    RULE_DEFINER_SEARCH_PATH,
                    format!(
                        "security definer function {} does not set search_path in its own definition",
                        block.name.display()
                    ),
                )
                .at(Location::file(script.id.clone(), block.line)),
            );
        }

        if heuristics::has_select_star(body) {
            out.push(
                Finding::error(
                    RULE_DEFINER_SELECT_STAR,
                    format!(
                        "security definer function {} projects full rows (SELECT *) in its body",
                        block.name.display()
                    ),
                )
                .at(Location::file(script.id.clone(), block.body_line)),
            );
        }
    }
}

fn drop_policy_rule(script: &MigrationScript, classified: &[Classified], out: &mut Vec<Finding>) {
    let created_on: Vec<&QualifiedName> = classified
        .iter()
        .filter_map(|item| match &item.kind {
            StatementKind::CreatePolicy(policy) => Some(&policy.table),
            _ => None,
        })
        .collect();

    for item in classified {
        let StatementKind::DropPolicy { name, table } = &item.kind else {
            continue;
        };
        // any new policy on the same table counts as a replacement
        let replaced = created_on.iter().any(|t| same_relation(t, table));
        if !replaced {
            out.push(
                Finding::warning(
                    RULE_DROP_WITHOUT_REPLACEMENT,
                    format!(
                        "policy \"{}\" dropped from {} with no replacement policy in this script",
                        name,
                        table.display()
                    ),
                )
                .at(Location::file(script.id.clone(), item.statement.line)),
            );
        }
    }
}

fn table_rls_rule(
    script: &MigrationScript,
    classified: &[Classified],
    config: &GuardConfig,
    out: &mut Vec<Finding>,
) {
    let enabled: Vec<&QualifiedName> = classified
        .iter()
        .filter_map(|item| match &item.kind {
            StatementKind::AlterTableRls { table, action } if action == "enable" => Some(table),
            _ => None,
        })
        .collect();

    for item in classified {
        let StatementKind::CreateTable { table } = &item.kind else {
            continue;
        };
        let schema = table.schema.as_deref().unwrap_or("public");
        if !config.in_scope_schema(schema) {
            continue;
        }
        if !enabled.iter().any(|t| same_relation(t, table)) {
            out.push(
                Finding::warning(
                    RULE_TABLE_WITHOUT_RLS,
                    format!(
                        "table {} created without ENABLE ROW LEVEL SECURITY in the same script",
                        table.display()
                    ),
                )
                .at(Location::file(script.id.clone(), item.statement.line)),
            );
        }
    }
}

/// Lint scripts in order and collect one report.
pub fn lint_scripts(scripts: &[MigrationScript], config: &GuardConfig) -> Report {
    let mut report = Report::new("lint");
    for script in scripts {
        let findings = lint_script(script, config);
        tracing::debug!(script = %script.id, findings = findings.len(), "linted");
        report.extend(findings);
    }
    report
        .notes
        .push(format!("lint: scanned {} migration script(s)", scripts.len()));
    report
}

fn sql_files_in(dir: &Path) -> Result<Vec<PathBuf>, GuardError> {
    if !dir.is_dir() {
        return Err(GuardError::NotFound(format!(
            "migrations directory {}",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "sql") {
            files.push(path);
        }
    }
    Ok(files)
}

fn git(root: &Path, args: &[&str]) -> Result<String, GuardError> {
    let output = Command::new("git")
        .current_dir(root)
        .args(args)
        .output()
        .map_err(|e| GuardError::Git(format!("failed to run git: {}", e)))?;
    if !output.status.success() {
        return Err(GuardError::Git(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn staged_files(root: &Path, migrations_dir: &Path) -> Result<Vec<PathBuf>, GuardError> {
    let toplevel = PathBuf::from(git(root, &["rev-parse", "--show-toplevel"])?.trim());
    let staged = git(
        root,
        &["diff", "--cached", "--name-only", "--diff-filter=ACMR"],
    )?;
    let migrations_dir = fs::canonicalize(migrations_dir).unwrap_or_else(|_| migrations_dir.to_path_buf());
    Ok(staged
        .lines()
        .map(|line| toplevel.join(line.trim()))
        .filter(|path| path.extension().is_some_and(|e| e == "sql"))
        .filter(|path| {
            fs::canonicalize(path)
                .map(|p| p.starts_with(&migrations_dir))
                .unwrap_or(false)
        })
        .collect())
}

/// Resolve the selection to scripts, sorted by file name (timestamp order).
pub fn collect_scripts(
    config: &GuardConfig,
    selection: &InputSelection,
    root: &Path,
) -> Result<Vec<MigrationScript>, GuardError> {
    let mut paths = match selection {
        InputSelection::Corpus => sql_files_in(&config.paths.migrations_dir)?,
        InputSelection::Staged => staged_files(root, &config.paths.migrations_dir)?,
        InputSelection::Files(files) => files
            .iter()
            .map(|f| if f.is_relative() { root.join(f) } else { f.clone() })
            .collect(),
    };
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)));
    paths.dedup();
    paths.iter().map(|p| MigrationScript::from_path(p)).collect()
}

pub fn run_lint(
    config: &GuardConfig,
    selection: &InputSelection,
    root: &Path,
) -> Result<Report, GuardError> {
    let scripts = collect_scripts(config, selection, root)?;
    tracing::info!(scripts = scripts.len(), ?selection, "linting migrations");
    Ok(lint_scripts(&scripts, config))
}
