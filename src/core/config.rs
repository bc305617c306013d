//! `rlsguard.toml` configuration.
//!
//! Every field has a default, so a repository without a config file gets the
//! conventional layout (`supabase/migrations`, `profiles` as identity table).
//! A config file that exists but does not parse is a tool-fatal error.

use crate::core::error::GuardError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "rlsguard.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    pub paths: PathsConfig,
    pub database: DatabaseConfig,
    pub schema: SchemaConfig,
    pub heuristics: HeuristicsConfig,
    pub attack: AttackConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub migrations_dir: PathBuf,
    pub registry: PathBuf,
    pub snapshot: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("supabase/migrations"),
            registry: PathBuf::from("security/definer-registry.json"),
            snapshot: PathBuf::from("security/policy-snapshot.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Environment variables consulted, in order, for a full connection URL.
    pub url_env: Vec<String>,
    /// Project reference used to compose a hosted connection URL.
    pub project_ref_env: String,
    pub password_env: String,
    /// Host template; `{project_ref}` is substituted.
    pub host_template: String,
    pub user: String,
    pub dbname: String,
    pub port: u16,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url_env: vec!["DATABASE_URL".to_string(), "SUPABASE_DB_URL".to_string()],
            project_ref_env: "SUPABASE_PROJECT_REF".to_string(),
            password_env: "SUPABASE_DB_PASSWORD".to_string(),
            host_template: "db.{project_ref}.supabase.co".to_string(),
            user: "postgres".to_string(),
            dbname: "postgres".to_string(),
            port: 5432,
            max_connections: 2,
            connect_timeout_secs: 15,
            statement_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchemaConfig {
    /// Schemas whose tables, policies and functions are governed.
    pub schemas: Vec<String>,
    /// Table holding one row per tenant user.
    pub identity_table: String,
    pub identity_column: String,
    /// Tables where a SELECT policy without an identity gate is an error.
    pub critical_tables: Vec<String>,
    /// Tables where every policy, of any command, must gate on identity.
    pub sensitive_tables: Vec<String>,
    /// Tables that must never be readable (one-time codes, internal diagnostics).
    pub secret_tables: Vec<String>,
    /// Column names whose access marks a function as touching sensitive data.
    pub sensitive_columns: Vec<String>,
    /// Private contact fields; a subset of sensitive columns.
    pub contact_columns: Vec<String>,
    /// Tenancy-scoping columns that must never be rewritten once set.
    pub immutable_columns: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            schemas: vec!["public".to_string()],
            identity_table: "profiles".to_string(),
            identity_column: "id".to_string(),
            critical_tables: vec![
                "profiles".to_string(),
                "messages".to_string(),
                "connections".to_string(),
            ],
            sensitive_tables: vec!["profiles".to_string(), "messages".to_string()],
            secret_tables: vec!["verification_codes".to_string(), "error_logs".to_string()],
            sensitive_columns: vec![
                "email".to_string(),
                "phone".to_string(),
                "phone_number".to_string(),
                "date_of_birth".to_string(),
                "address".to_string(),
            ],
            contact_columns: vec!["email".to_string(), "phone".to_string()],
            immutable_columns: vec![
                "user_id".to_string(),
                "tenant_id".to_string(),
                "organization_id".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeuristicsConfig {
    /// Fragments (normalized, lowercase) that denote the caller's identity.
    pub identity_markers: Vec<String>,
    /// Fragments that denote an administrator-capability gate.
    pub admin_markers: Vec<String>,
    /// Functions allowed to touch sensitive fields: self-access, auth and merge flows.
    pub pii_allowlist: Vec<String>,
    /// Lookup procedures that must exist so public reads never need table access.
    pub public_directory_functions: Vec<String>,
    /// Name patterns (regex) of code generators that must not exist in readable form.
    pub forbidden_function_patterns: Vec<String>,
    /// Name patterns (regex) of procedures that merge tenant identities.
    pub merge_function_patterns: Vec<String>,
    /// Name patterns (regex) of procedures that re-key a tenant identity.
    pub rekey_function_patterns: Vec<String>,
    /// Relations a conflicting identity could live in; duplicate checks must cover all.
    pub identity_locations: Vec<String>,
    /// Name pattern (regex) of functions assembling profile responses.
    pub profile_function_pattern: String,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            identity_markers: vec![
                "auth . uid ( )".to_string(),
                "auth . jwt ( )".to_string(),
                "current_setting ( 'request.jwt.claim.sub'".to_string(),
            ],
            admin_markers: vec![
                "is_admin (".to_string(),
                "has_role (".to_string(),
                "'service_role'".to_string(),
            ],
            pii_allowlist: vec![
                "get_my_profile".to_string(),
                "get_own_profile".to_string(),
                "handle_new_user".to_string(),
                "merge_accounts".to_string(),
                "change_email".to_string(),
            ],
            public_directory_functions: vec![
                "get_public_profile".to_string(),
                "search_public_profiles".to_string(),
            ],
            forbidden_function_patterns: vec![
                r"^generate_.*(code|otp|token)$".to_string(),
                r"^create_.*otp$".to_string(),
            ],
            merge_function_patterns: vec![r"merge".to_string()],
            rekey_function_patterns: vec![
                r"^(change|update|rekey)_.*(email|identity|handle)".to_string(),
            ],
            identity_locations: vec!["profiles".to_string(), "auth.users".to_string()],
            profile_function_pattern: r"profile".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttackConfig {
    /// Attacker and victim user ids; discovered from the identity table when unset.
    pub attacker_id: Option<String>,
    pub victim_id: Option<String>,
    /// Role the simulated attacker runs as.
    pub attacker_role: String,
    /// Email domain forged into the attacker's claims.
    pub forged_domain: String,
    /// Domain passed to the public directory procedure.
    pub foreign_domain: String,
    pub directory_function: String,
    pub contact_column: String,
    pub otp_table: String,
    pub diagnostics_table: String,
    pub content_table: String,
    pub content_owner_column: String,
    pub messages_table: String,
    pub message_sender_column: String,
    pub message_recipient_column: String,
    pub connections_table: String,
    pub connection_requester_column: String,
    pub connection_addressee_column: String,
    /// Column on the identity table holding the tenant's email domain.
    pub domain_column: String,
    /// Scenario ids not to run.
    pub skip: Vec<String>,
    /// `table:privilege` pairs anonymous/public roles may hold directly.
    pub public_read_allowlist: Vec<String>,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            attacker_id: None,
            victim_id: None,
            attacker_role: "authenticated".to_string(),
            forged_domain: "victim-corp.example".to_string(),
            foreign_domain: "victim-corp.example".to_string(),
            directory_function: "search_public_profiles".to_string(),
            contact_column: "email".to_string(),
            otp_table: "verification_codes".to_string(),
            diagnostics_table: "error_logs".to_string(),
            content_table: "posts".to_string(),
            content_owner_column: "user_id".to_string(),
            messages_table: "messages".to_string(),
            message_sender_column: "sender_id".to_string(),
            message_recipient_column: "recipient_id".to_string(),
            connections_table: "connections".to_string(),
            connection_requester_column: "requester_id".to_string(),
            connection_addressee_column: "addressee_id".to_string(),
            domain_column: "email_domain".to_string(),
            skip: Vec::new(),
            public_read_allowlist: Vec::new(),
        }
    }
}

impl GuardConfig {
    /// Load from an explicit path (must exist) or from `rlsguard.toml` in `root`
    /// (optional; defaults apply when absent).
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self, GuardError> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(GuardError::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => {
                let candidate = root.join(DEFAULT_CONFIG_FILE);
                if !candidate.exists() {
                    tracing::debug!("no {} found; using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default().rooted(root));
                }
                candidate
            }
        };

        let content = fs::read_to_string(&path)?;
        let config: GuardConfig = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config.rooted(root))
    }

    /// Resolve relative document paths against the repository root.
    fn rooted(mut self, root: &Path) -> Self {
        for path in [
            &mut self.paths.migrations_dir,
            &mut self.paths.registry,
            &mut self.paths.snapshot,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
        self
    }

    fn validate(&self) -> Result<(), GuardError> {
        if self.schema.schemas.is_empty() {
            return Err(GuardError::Config(
                "schema.schemas must name at least one schema".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(GuardError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        let patterns = self
            .heuristics
            .forbidden_function_patterns
            .iter()
            .chain(&self.heuristics.merge_function_patterns)
            .chain(&self.heuristics.rekey_function_patterns)
            .chain(std::iter::once(&self.heuristics.profile_function_pattern));
        for pattern in patterns {
            regex::Regex::new(pattern).map_err(|e| {
                GuardError::Config(format!("invalid pattern {:?}: {}", pattern, e))
            })?;
        }
        Ok(())
    }

    pub fn in_scope_schema(&self, schema: &str) -> bool {
        self.schema.schemas.iter().any(|s| s == schema)
    }
}
