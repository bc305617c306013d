//! Destructive security tests: scripted tenant attacks against the live database.
//!
//! Every attack runs inside an [`Impersonation`]: a transaction on a pooled
//! connection whose attacker claims are set with transaction-local
//! `set_config`. The transaction is always rolled back, so neither a blocked
//! nor a successful attack leaves rows behind, and the claims never outlive
//! the scenario on a reused connection.
//!
//! A scenario passes when the operation sees or touches zero rows, or when the
//! database refuses it with a permission or row-level-security error. Any
//! other database error is reported against that scenario only; connectivity
//! failures and timeouts abort the run. Refusals only count for the attack
//! statement itself: if the attacker identity cannot be assumed, nothing was
//! attempted and the run aborts.

use crate::core::catalog;
use crate::core::config::GuardConfig;
use crate::core::db;
use crate::core::error::GuardError;
use crate::core::finding::{CheckOutcome, Finding, Location, Report};
use crate::core::heuristics;
use sqlx::postgres::{PgConnection, PgPool, Postgres};
use sqlx::{Row, Transaction};

/// Claims presented by the simulated attacker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    /// Forged email claim, for attacks on domain-gated reads.
    pub email: Option<String>,
}

impl Claims {
    pub fn to_json(&self) -> String {
        let mut claims = serde_json::json!({
            "sub": self.sub,
            "role": self.role,
        });
        if let Some(email) = &self.email {
            claims["email"] = serde_json::Value::String(email.clone());
        }
        claims.to_string()
    }
}

/// A transaction acting as a tenant. Dropping it without [`finish`] still
/// rolls back.
///
/// [`finish`]: Impersonation::finish
pub struct Impersonation {
    tx: Transaction<'static, Postgres>,
}

impl Impersonation {
    pub async fn begin(pool: &PgPool, claims: &Claims) -> Result<Self, GuardError> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            "SELECT set_config('request.jwt.claims', $1, true), \
                    set_config('request.jwt.claim.sub', $2, true), \
                    set_config('role', $3, true)",
        )
        .bind(claims.to_json())
        .bind(&claims.sub)
        .bind(&claims.role)
        .execute(&mut *tx)
        .await
        .map_err(|err| impersonation_error(claims, err))?;
        Ok(Self { tx })
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub async fn finish(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

/// Setup failures are tool failures. A refusal here (say 42501 on
/// `set_config('role', ...)`) must never be read as a blocked attack.
fn impersonation_error(claims: &Claims, err: sqlx::Error) -> GuardError {
    if db::is_statement_timeout(&err) {
        return GuardError::Timeout(format!("impersonation setup cancelled: {}", err));
    }
    match err {
        sqlx::Error::Database(db_err) => GuardError::Impersonation(format!(
            "cannot act as {} with role {}: {} {}",
            claims.sub,
            claims.role,
            db_err.code().as_deref().unwrap_or("?????"),
            db_err.message()
        )),
        other => GuardError::Database(other),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Any returned row is a breach.
    Visible,
    /// Any affected row is a breach.
    Mutates,
    /// A returned JSON document with a non-null `key` anywhere is a breach.
    JsonLeak { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Blocked,
    Denied(String),
    Breached(u64),
    Errored(String),
}

impl ProbeOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ProbeOutcome::Blocked | ProbeOutcome::Denied(_))
    }
}

/// Database-side refusal of a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeError {
    pub code: Option<String>,
    pub message: String,
}

/// Permission and row-level-security refusals are the expected outcome.
pub fn classify(err: &ProbeError) -> ProbeOutcome {
    let message = err.message.to_ascii_lowercase();
    if err.code.as_deref() == Some("42501")
        || message.contains("row-level security")
        || message.contains("permission denied")
    {
        ProbeOutcome::Denied(err.message.clone())
    } else {
        let code = err.code.as_deref().unwrap_or("?????");
        ProbeOutcome::Errored(format!("{} {}", code, err.message))
    }
}

#[derive(Debug, Clone)]
pub struct Attack {
    pub id: &'static str,
    pub title: &'static str,
    pub probe: Probe,
    pub sql: String,
    pub binds: Vec<String>,
    pub claims: Claims,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixtures {
    pub attacker: String,
    pub victim: String,
}

/// Quote a possibly schema-qualified identifier.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// The scripted attacks, in execution order.
pub fn scenarios(config: &GuardConfig, fixtures: &Fixtures) -> Vec<Attack> {
    let a = &config.attack;
    let identity = quote_ident(&config.schema.identity_table);
    let id_col = quote_ident(&config.schema.identity_column);
    let contact = quote_ident(&a.contact_column);
    let attacker = Claims {
        sub: fixtures.attacker.clone(),
        role: a.attacker_role.clone(),
        email: None,
    };
    let victim = || vec![fixtures.victim.clone()];

    vec![
        Attack {
            id: "cross-tenant-contact-read",
            title: "read another tenant's private contact field",
            probe: Probe::Visible,
            sql: format!(
                "SELECT {contact} FROM {identity} WHERE {id_col}::text = $1 AND {contact} IS NOT NULL"
            ),
            binds: victim(),
            claims: attacker.clone(),
        },
        Attack {
            id: "cross-tenant-profile-read",
            title: "read another tenant's full profile row",
            probe: Probe::Visible,
            sql: format!("SELECT * FROM {identity} WHERE {id_col}::text = $1"),
            binds: victim(),
            claims: attacker.clone(),
        },
        Attack {
            id: "otp-table-read",
            title: "read the one-time-code table directly",
            probe: Probe::Visible,
            sql: format!("SELECT 1 FROM {} LIMIT 1", quote_ident(&a.otp_table)),
            binds: Vec::new(),
            claims: attacker.clone(),
        },
        Attack {
            id: "directory-contact-leak",
            title: "public directory lookup leaks a foreign tenant's contact field",
            probe: Probe::JsonLeak {
                key: a.contact_column.clone(),
            },
            sql: format!(
                "SELECT to_jsonb(r)::text FROM {}($1) AS r",
                quote_ident(&a.directory_function)
            ),
            binds: vec![a.foreign_domain.clone()],
            claims: attacker.clone(),
        },
        Attack {
            id: "cross-tenant-profile-update",
            title: "update another tenant's profile row",
            probe: Probe::Mutates,
            sql: format!("UPDATE {identity} SET {id_col} = {id_col} WHERE {id_col}::text = $1"),
            binds: victim(),
            claims: attacker.clone(),
        },
        Attack {
            id: "connection-impersonation",
            title: "create a connection on behalf of another party",
            probe: Probe::Mutates,
            sql: {
                let table = quote_ident(&a.connections_table);
                let requester = quote_ident(&a.connection_requester_column);
                let addressee = quote_ident(&a.connection_addressee_column);
                format!(
                    "INSERT INTO {table} ({requester}, {addressee}) \
                     SELECT r.{requester}, r.{addressee} \
                     FROM json_populate_record(NULL::{table}, json_build_object('{req}', $1::text, '{add}', $2::text)) AS r",
                    req = a.connection_requester_column.replace('\'', "''"),
                    add = a.connection_addressee_column.replace('\'', "''"),
                )
            },
            binds: vec![fixtures.victim.clone(), fixtures.attacker.clone()],
            claims: attacker.clone(),
        },
        Attack {
            id: "cross-tenant-content-delete",
            title: "delete another tenant's content",
            probe: Probe::Mutates,
            sql: format!(
                "DELETE FROM {} WHERE {}::text = $1",
                quote_ident(&a.content_table),
                quote_ident(&a.content_owner_column)
            ),
            binds: victim(),
            claims: attacker.clone(),
        },
        Attack {
            id: "foreign-message-read",
            title: "read messages the caller is not party to",
            probe: Probe::Visible,
            sql: format!(
                "SELECT 1 FROM {} WHERE {}::text IS DISTINCT FROM $1 AND {}::text IS DISTINCT FROM $1 LIMIT 1",
                quote_ident(&a.messages_table),
                quote_ident(&a.message_sender_column),
                quote_ident(&a.message_recipient_column)
            ),
            binds: vec![fixtures.attacker.clone()],
            claims: attacker.clone(),
        },
        Attack {
            id: "forged-domain-read",
            title: "forged email-domain claim reads another tenant's rows",
            probe: Probe::Visible,
            sql: format!(
                "SELECT 1 FROM {identity} WHERE {} = $1 AND {id_col}::text <> $2 LIMIT 1",
                quote_ident(&a.domain_column)
            ),
            binds: vec![a.forged_domain.clone(), fixtures.attacker.clone()],
            claims: Claims {
                email: Some(format!("attacker@{}", a.forged_domain)),
                ..attacker.clone()
            },
        },
        Attack {
            id: "diagnostics-read",
            title: "read the internal error log table",
            probe: Probe::Visible,
            sql: format!("SELECT 1 FROM {} LIMIT 1", quote_ident(&a.diagnostics_table)),
            binds: Vec::new(),
            claims: attacker,
        },
    ]
}

/// True when `value` holds `key` with a non-null value at any depth.
pub fn json_leaks(value: &serde_json::Value, key: &str) -> bool {
    match value {
        serde_json::Value::Object(map) => map.iter().any(|(k, v)| {
            (k.eq_ignore_ascii_case(key) && !v.is_null()) || json_leaks(v, key)
        }),
        serde_json::Value::Array(items) => items.iter().any(|v| json_leaks(v, key)),
        _ => false,
    }
}

async fn execute(session: &mut Impersonation, attack: &Attack) -> Result<ProbeOutcome, sqlx::Error> {
    let mut query = sqlx::query(&attack.sql);
    for bind in &attack.binds {
        query = query.bind(bind);
    }
    match &attack.probe {
        Probe::Visible => {
            let rows = query.fetch_all(session.conn()).await?;
            Ok(match rows.len() {
                0 => ProbeOutcome::Blocked,
                n => ProbeOutcome::Breached(n as u64),
            })
        }
        Probe::Mutates => {
            let affected = query.execute(session.conn()).await?.rows_affected();
            Ok(match affected {
                0 => ProbeOutcome::Blocked,
                n => ProbeOutcome::Breached(n),
            })
        }
        Probe::JsonLeak { key } => {
            let rows = query.fetch_all(session.conn()).await?;
            let mut leaks = 0u64;
            for row in rows {
                let Some(text) = row.try_get::<Option<String>, _>(0)? else {
                    continue;
                };
                let doc: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(doc) => doc,
                    Err(e) => return Ok(ProbeOutcome::Errored(format!("unreadable response: {}", e))),
                };
                if json_leaks(&doc, key) {
                    leaks += 1;
                }
            }
            Ok(if leaks == 0 {
                ProbeOutcome::Blocked
            } else {
                ProbeOutcome::Breached(leaks)
            })
        }
    }
}

/// Separate per-scenario outcomes from failures that must abort the run.
fn settle(result: Result<ProbeOutcome, sqlx::Error>) -> Result<ProbeOutcome, GuardError> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(err) if db::is_statement_timeout(&err) => {
            Err(GuardError::Timeout(format!("attack query cancelled: {}", err)))
        }
        Err(sqlx::Error::Database(db_err)) => Ok(classify(&ProbeError {
            code: db_err.code().map(|c| c.into_owned()),
            message: db_err.message().to_string(),
        })),
        Err(err @ sqlx::Error::ColumnDecode { .. }) => Ok(ProbeOutcome::Errored(err.to_string())),
        Err(other) => Err(GuardError::Database(other)),
    }
}

pub async fn run_attack(pool: &PgPool, attack: &Attack) -> Result<ProbeOutcome, GuardError> {
    let mut session = Impersonation::begin(pool, &attack.claims).await?;
    let result = execute(&mut session, attack).await;
    session.finish().await?;
    settle(result)
}

fn outcome_check(attack: &Attack, outcome: &ProbeOutcome) -> CheckOutcome {
    let location = Location::object(attack.id);
    let finding = match outcome {
        ProbeOutcome::Blocked => Finding::info(attack.id, "blocked: no rows visible or affected"),
        ProbeOutcome::Denied(message) => {
            Finding::info(attack.id, format!("denied by the database: {}", message))
        }
        ProbeOutcome::Breached(n) => Finding::error(
            attack.id,
            format!("BREACH: {} row(s) reachable by the attacker ({})", n, attack.title),
        ),
        ProbeOutcome::Errored(message) => {
            Finding::error(attack.id, format!("scenario errored: {}", message))
        }
    };
    CheckOutcome::from_findings(attack.id, attack.title, vec![finding.at(location)])
}

/// Attacker and victim ids from config, else the first two identity rows.
pub async fn resolve_fixtures(pool: &PgPool, config: &GuardConfig) -> Result<Fixtures, GuardError> {
    if let (Some(attacker), Some(victim)) = (&config.attack.attacker_id, &config.attack.victim_id) {
        return Ok(Fixtures {
            attacker: attacker.clone(),
            victim: victim.clone(),
        });
    }
    let id_col = quote_ident(&config.schema.identity_column);
    let sql = format!(
        "SELECT {id_col}::text FROM {} ORDER BY {id_col} LIMIT 2",
        quote_ident(&config.schema.identity_table)
    );
    let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(pool).await?;
    match ids.as_slice() {
        [attacker, victim] => {
            tracing::info!(%attacker, %victim, "attack fixtures discovered from identity table");
            Ok(Fixtures {
                attacker: attacker.clone(),
                victim: victim.clone(),
            })
        }
        _ => Err(GuardError::Config(format!(
            "attack needs two rows in {} or [attack].attacker_id and victim_id",
            config.schema.identity_table
        ))),
    }
}

fn audit_true_select(policies: &[catalog::PolicyDefinition]) -> Vec<Finding> {
    policies
        .iter()
        .filter(|p| p.governs_select())
        .filter(|p| p.using.as_deref().is_some_and(heuristics::is_unconditional_true))
        .map(|p| {
            Finding::error(
                "audit-true-select-policies",
                format!("policy \"{}\" on {} is USING (true)", p.name, p.table),
            )
            .at(Location::object(p.key()))
        })
        .collect()
}

fn audit_grants(grants: &[catalog::TableGrant], config: &GuardConfig) -> Vec<Finding> {
    grants
        .iter()
        .filter(|g| {
            let pair = format!("{}:{}", g.table, g.privilege).to_ascii_lowercase();
            !config
                .attack
                .public_read_allowlist
                .iter()
                .any(|allowed| allowed.to_ascii_lowercase() == pair)
        })
        .map(|g| {
            Finding::error(
                "audit-public-grants",
                format!("{} holds {} directly on {}", g.grantee, g.privilege, g.table),
            )
            .at(Location::object(format!("{}.{}", g.schema, g.table)))
        })
        .collect()
}

fn audit_outcome(
    id: &str,
    title: &str,
    result: Result<Vec<Finding>, GuardError>,
) -> Result<CheckOutcome, GuardError> {
    match result {
        Ok(findings) => Ok(CheckOutcome::from_findings(id, title, findings)),
        Err(err) if err.is_connectivity() => Err(err),
        Err(err) => Ok(CheckOutcome::errored(id, title, err)),
    }
}

pub async fn run_attacks(pool: &PgPool, config: &GuardConfig) -> Result<Report, GuardError> {
    let fixtures = resolve_fixtures(pool, config).await?;
    let mut report = Report::new("attack");

    for attack in scenarios(config, &fixtures) {
        if config.attack.skip.iter().any(|s| s == attack.id) {
            report.push_check(CheckOutcome::skipped(
                attack.id,
                attack.title,
                "skipped by [attack].skip",
            ));
            continue;
        }
        let outcome = run_attack(pool, &attack).await?;
        tracing::debug!(scenario = attack.id, ?outcome, "attack finished");
        if !outcome.passed() {
            tracing::warn!(scenario = attack.id, ?outcome, "attack not blocked");
        }
        report.push_check(outcome_check(&attack, &outcome));
    }

    let schemas = &config.schema.schemas;
    let policies = catalog::load_policies(pool, schemas)
        .await
        .map(|p| audit_true_select(&p));
    report.push_check(audit_outcome(
        "audit-true-select-policies",
        "no unconditionally true SELECT policies",
        policies,
    )?);
    let grants = catalog::load_public_grants(pool, schemas)
        .await
        .map(|g| audit_grants(&g, config));
    report.push_check(audit_outcome(
        "audit-public-grants",
        "no direct table grants to anonymous or public roles",
        grants,
    )?);

    Ok(report)
}
