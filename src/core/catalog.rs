//! Live security state read from the system catalogs.
//!
//! The loader runs a fixed set of read-only catalog queries, once per run.
//! Everything downstream (invariants, snapshots, registry reconciliation)
//! works on the in-memory [`CatalogState`].

use crate::core::error::GuardError;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// One row-level-security rule. Identity key: `(schema.table, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PolicyDefinition {
    pub schema: String,
    #[sqlx(rename = "table_name")]
    pub table: String,
    pub name: String,
    /// `select`, `insert`, `update`, `delete` or `all`.
    pub command: String,
    pub permissive: bool,
    pub roles: Vec<String>,
    #[sqlx(rename = "using_expr")]
    pub using: Option<String>,
    pub with_check: Option<String>,
}

impl PolicyDefinition {
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }

    /// Policies that govern reads: `select` and `all`.
    pub fn governs_select(&self) -> bool {
        matches!(self.command.as_str(), "select" | "all")
    }
}

/// A stored procedure. Privileged (security-definer) functions are the ones
/// with `security_definer = true`. Identity key: `schema.name(args)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FunctionDef {
    pub schema: String,
    pub name: String,
    pub args: String,
    pub returns: Option<String>,
    pub security_definer: bool,
    /// Session-configuration overrides, `param=value`.
    pub config: Vec<String>,
    pub body: String,
    pub language: String,
}

impl FunctionDef {
    pub fn key(&self) -> String {
        format!("{}.{}({})", self.schema, self.name, self.args)
    }

    pub fn sets_search_path(&self) -> bool {
        self.config
            .iter()
            .any(|entry| entry.to_ascii_lowercase().starts_with("search_path="))
    }

    pub fn returns_value(&self) -> bool {
        match self.returns.as_deref() {
            Some(ret) => !matches!(ret.trim().to_ascii_lowercase().as_str(), "void" | "trigger"),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TableRls {
    pub schema: String,
    #[sqlx(rename = "table_name")]
    pub table: String,
    pub rls_enabled: bool,
    pub rls_forced: bool,
}

impl TableRls {
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerDef {
    pub schema: String,
    #[sqlx(rename = "table_name")]
    pub table: String,
    pub name: String,
    pub function_schema: String,
    pub function_name: String,
    pub function_body: String,
}

/// A direct table privilege held by an anonymous or public role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TableGrant {
    pub schema: String,
    #[sqlx(rename = "table_name")]
    pub table: String,
    pub grantee: String,
    pub privilege: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogState {
    pub policies: Vec<PolicyDefinition>,
    pub functions: Vec<FunctionDef>,
    pub tables: Vec<TableRls>,
    pub triggers: Vec<TriggerDef>,
    pub grants: Vec<TableGrant>,
}

impl CatalogState {
    pub fn privileged_functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.iter().filter(|f| f.security_definer)
    }

    pub fn policies_on<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a PolicyDefinition> {
        self.policies.iter().filter(move |p| p.table == table)
    }

    pub fn functions_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FunctionDef> {
        self.functions.iter().filter(move |f| f.name == name)
    }

    pub fn table(&self, name: &str) -> Option<&TableRls> {
        self.tables.iter().find(|t| t.table == name)
    }
}

const POLICIES_SQL: &str = r#"
SELECT schemaname::text AS schema,
       tablename::text AS table_name,
       policyname::text AS name,
       lower(cmd) AS command,
       (permissive = 'PERMISSIVE') AS permissive,
       roles::text[] AS roles,
       qual AS using_expr,
       with_check
FROM pg_catalog.pg_policies
WHERE schemaname = ANY($1)
ORDER BY schemaname, tablename, policyname
"#;

const FUNCTIONS_SQL: &str = r#"
SELECT n.nspname::text AS schema,
       p.proname::text AS name,
       pg_catalog.pg_get_function_identity_arguments(p.oid) AS args,
       pg_catalog.pg_get_function_result(p.oid) AS returns,
       p.prosecdef AS security_definer,
       COALESCE(p.proconfig, ARRAY[]::text[]) AS config,
       p.prosrc AS body,
       l.lanname::text AS language
FROM pg_catalog.pg_proc p
JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
JOIN pg_catalog.pg_language l ON l.oid = p.prolang
WHERE n.nspname = ANY($1)
  AND p.prokind IN ('f', 'p')
  AND NOT EXISTS (
      SELECT 1 FROM pg_catalog.pg_depend d
      WHERE d.objid = p.oid AND d.deptype = 'e'
  )
ORDER BY 1, 2, 3
"#;

const TABLES_SQL: &str = r#"
SELECT n.nspname::text AS schema,
       c.relname::text AS table_name,
       c.relrowsecurity AS rls_enabled,
       c.relforcerowsecurity AS rls_forced
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'p')
  AND n.nspname = ANY($1)
ORDER BY 1, 2
"#;

const TRIGGERS_SQL: &str = r#"
SELECT n.nspname::text AS schema,
       c.relname::text AS table_name,
       t.tgname::text AS name,
       pn.nspname::text AS function_schema,
       p.proname::text AS function_name,
       p.prosrc AS function_body
FROM pg_catalog.pg_trigger t
JOIN pg_catalog.pg_class c ON c.oid = t.tgrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
JOIN pg_catalog.pg_proc p ON p.oid = t.tgfoid
JOIN pg_catalog.pg_namespace pn ON pn.oid = p.pronamespace
WHERE NOT t.tgisinternal
  AND n.nspname = ANY($1)
ORDER BY 1, 2, 3
"#;

const GRANTS_SQL: &str = r#"
SELECT table_schema::text AS schema,
       table_name::text AS table_name,
       grantee::text AS grantee,
       privilege_type::text AS privilege
FROM information_schema.role_table_grants
WHERE table_schema = ANY($1)
  AND grantee IN ('anon', 'PUBLIC')
ORDER BY 1, 2, 3, 4
"#;

pub async fn load_policies(
    pool: &PgPool,
    schemas: &[String],
) -> Result<Vec<PolicyDefinition>, GuardError> {
    Ok(sqlx::query_as::<_, PolicyDefinition>(POLICIES_SQL)
        .bind(schemas)
        .fetch_all(pool)
        .await?)
}

pub async fn load_functions(
    pool: &PgPool,
    schemas: &[String],
) -> Result<Vec<FunctionDef>, GuardError> {
    Ok(sqlx::query_as::<_, FunctionDef>(FUNCTIONS_SQL)
        .bind(schemas)
        .fetch_all(pool)
        .await?)
}

pub async fn load_tables(pool: &PgPool, schemas: &[String]) -> Result<Vec<TableRls>, GuardError> {
    Ok(sqlx::query_as::<_, TableRls>(TABLES_SQL)
        .bind(schemas)
        .fetch_all(pool)
        .await?)
}

pub async fn load_triggers(
    pool: &PgPool,
    schemas: &[String],
) -> Result<Vec<TriggerDef>, GuardError> {
    Ok(sqlx::query_as::<_, TriggerDef>(TRIGGERS_SQL)
        .bind(schemas)
        .fetch_all(pool)
        .await?)
}

pub async fn load_public_grants(
    pool: &PgPool,
    schemas: &[String],
) -> Result<Vec<TableGrant>, GuardError> {
    Ok(sqlx::query_as::<_, TableGrant>(GRANTS_SQL)
        .bind(schemas)
        .fetch_all(pool)
        .await?)
}

/// Load the full catalog state. Any failure here is tool-fatal.
pub async fn load(pool: &PgPool, schemas: &[String]) -> Result<CatalogState, GuardError> {
    let state = CatalogState {
        policies: load_policies(pool, schemas).await?,
        functions: load_functions(pool, schemas).await?,
        tables: load_tables(pool, schemas).await?,
        triggers: load_triggers(pool, schemas).await?,
        grants: load_public_grants(pool, schemas).await?,
    };
    tracing::debug!(
        policies = state.policies.len(),
        functions = state.functions.len(),
        tables = state.tables.len(),
        triggers = state.triggers.len(),
        grants = state.grants.len(),
        "catalog loaded"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(returns: Option<&str>, config: &[&str]) -> FunctionDef {
        FunctionDef {
            schema: "public".into(),
            name: "f".into(),
            args: "p_id uuid".into(),
            returns: returns.map(str::to_string),
            security_definer: true,
            config: config.iter().map(|s| s.to_string()).collect(),
            body: String::new(),
            language: "sql".into(),
        }
    }

    #[test]
    fn function_key_includes_signature() {
        assert_eq!(function(None, &[]).key(), "public.f(p_id uuid)");
    }

    #[test]
    fn search_path_detected_in_config() {
        assert!(function(None, &["search_path=public, pg_temp"]).sets_search_path());
        assert!(function(None, &["SEARCH_PATH=\"\""]).sets_search_path());
        assert!(!function(None, &["statement_timeout=5s"]).sets_search_path());
    }

    #[test]
    fn void_and_trigger_do_not_return_values() {
        assert!(!function(Some("void"), &[]).returns_value());
        assert!(!function(Some("trigger"), &[]).returns_value());
        assert!(function(Some("text"), &[]).returns_value());
    }
}
