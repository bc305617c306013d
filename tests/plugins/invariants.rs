use rlsguard::core::catalog::{CatalogState, FunctionDef, PolicyDefinition, TableRls, TriggerDef};
use rlsguard::core::config::GuardConfig;
use rlsguard::core::finding::{CheckStatus, Report};
use rlsguard::plugins::invariants;

fn policy(table: &str, name: &str, command: &str, using: Option<&str>, check: Option<&str>) -> PolicyDefinition {
    PolicyDefinition {
        schema: "public".into(),
        table: table.into(),
        name: name.into(),
        command: command.into(),
        permissive: true,
        roles: vec!["authenticated".into()],
        using: using.map(str::to_string),
        with_check: check.map(str::to_string),
    }
}

fn table(name: &str) -> TableRls {
    TableRls {
        schema: "public".into(),
        table: name.into(),
        rls_enabled: true,
        rls_forced: false,
    }
}

fn definer(name: &str, returns: &str, body: &str) -> FunctionDef {
    FunctionDef {
        schema: "public".into(),
        name: name.into(),
        args: String::new(),
        returns: Some(returns.into()),
        security_definer: true,
        config: vec!["search_path=public, pg_temp".into()],
        body: body.into(),
        language: "plpgsql".into(),
    }
}

const CHANGE_EMAIL: &str = "
begin
  perform pg_advisory_xact_lock(hashtext(p_new_email));
  if exists (select 1 from profiles where email = p_new_email)
     or exists (select 1 from auth.users where email = p_new_email) then
    raise exception 'email in use';
  end if;
  update profiles set email = p_new_email where id = auth.uid();
end;";

const MERGE_ACCOUNTS: &str = "
begin
  perform pg_advisory_xact_lock(hashtext(p_source::text));
  select count(*) into n from profiles where id = p_target;
  if not exists (select 1 from auth.users where id = p_target) then
    raise exception 'missing target';
  end if;
  update posts set user_id = p_target where user_id = p_source;
end;";

fn hardened() -> CatalogState {
    CatalogState {
        tables: ["profiles", "messages", "connections", "posts", "verification_codes", "error_logs"]
            .into_iter()
            .map(table)
            .collect(),
        policies: vec![
            policy("profiles", "read own", "select", Some("(auth.uid() = id)"), None),
            policy("profiles", "admins read", "select", Some("is_admin(auth.uid())"), None),
            policy("profiles", "insert own", "insert", None, Some("(auth.uid() = id)")),
            policy(
                "messages",
                "participants",
                "select",
                Some("((auth.uid() = sender_id) OR (auth.uid() = recipient_id))"),
                None,
            ),
            policy("connections", "parties", "all", Some("(auth.uid() = requester_id)"), None),
            policy("posts", "published", "select", Some("(published = true)"), None),
            policy("verification_codes", "no reads", "select", Some("false"), None),
            policy("error_logs", "admins only", "select", Some("is_admin(auth.uid())"), None),
        ],
        functions: vec![
            definer(
                "get_public_profile",
                "json",
                "select json_build_object('id', id, 'display_name', display_name) from profiles where id = p_id",
            ),
            definer(
                "search_public_profiles",
                "json",
                "select json_agg(x) from (select id, display_name from profiles where display_name ilike q limit 50) x",
            ),
            definer("generate_verification_code", "void", "insert into verification_codes(code) values (gen())"),
            definer("change_email", "void", CHANGE_EMAIL),
            definer("merge_accounts", "void", MERGE_ACCOUNTS),
        ],
        triggers: vec![TriggerDef {
            schema: "public".into(),
            table: "posts".into(),
            name: "posts_touch".into(),
            function_schema: "public".into(),
            function_name: "touch_updated_at".into(),
            function_body: "begin if new.user_id = old.user_id then new.updated_at := now(); end if; return new; end;".into(),
        }],
        grants: vec![],
    }
}

fn status(report: &Report, id: &str) -> CheckStatus {
    report
        .checks
        .iter()
        .find(|c| c.id == id)
        .map(|c| c.status)
        .unwrap_or_else(|| panic!("no check {}", id))
}

#[test]
fn hardened_catalog_passes_every_invariant() {
    let report = invariants::run_battery(&hardened(), &GuardConfig::default());
    let failing: Vec<_> = report
        .checks
        .iter()
        .filter(|c| c.status == CheckStatus::Fail)
        .map(|c| (c.id.clone(), c.findings.iter().map(|f| f.message.clone()).collect::<Vec<_>>()))
        .collect();
    assert!(failing.is_empty(), "unexpected failures: {:?}", failing);
    // "published = true" on a non-critical table is only a warning
    assert_eq!(status(&report, "policy-audit"), CheckStatus::Warn);
    assert!(report.verdict().is_ok());
}

#[test]
fn open_identity_table_fails_the_identity_checks() {
    let mut state = hardened();
    state.policies[0].using = Some("true".into());
    let report = invariants::run_battery(&state, &GuardConfig::default());
    for id in [
        "identity-table-select-identity",
        "no-true-select-policies",
        "sensitive-table-identity",
        "policy-audit",
    ] {
        assert_eq!(status(&report, id), CheckStatus::Fail, "{}", id);
    }
    assert_eq!(status(&report, "rls-enabled"), CheckStatus::Pass);
}

#[test]
fn signed_in_check_is_not_an_identity_gate() {
    let mut state = hardened();
    state.policies[0].using = Some("(auth.uid() IS NOT NULL)".into());
    let report = invariants::run_battery(&state, &GuardConfig::default());
    for id in [
        "identity-table-select-identity",
        "sensitive-table-identity",
        "policy-audit",
    ] {
        assert_eq!(status(&report, id), CheckStatus::Fail, "{}", id);
    }
    // not literally true, so the unconditional check stays green
    assert_eq!(status(&report, "no-true-select-policies"), CheckStatus::Pass);

    state.policies[0].using = Some("((select auth.uid()) = id)".into());
    let report = invariants::run_battery(&state, &GuardConfig::default());
    assert_eq!(status(&report, "identity-table-select-identity"), CheckStatus::Pass);
}

#[test]
fn privileged_function_defects_fail_their_invariants() {
    let mut state = hardened();
    // leaks contact fields from a profile builder
    state.functions[0].body =
        "select json_build_object('id', id, 'email', email) from profiles where id = p_id".into();
    // unbounded aggregation and no pinned search_path
    state.functions[1].body = "select json_agg(p) from profiles p".into();
    state.functions[1].config.clear();
    // code generator hands the code back
    state.functions[2].returns = Some("text".into());
    // re-key without lock
    state.functions[3].body = state.functions[3].body.replace("pg_advisory_xact_lock", "pg_sleep");
    // merge without any duplicate probe
    state.functions[4].body = "begin perform pg_advisory_xact_lock(1); update posts set user_id = p_target; end;".into();
    state.functions.push(definer(
        "adopt_post",
        "void",
        "update posts set user_id = p_new_owner where id = p_post",
    ));

    let report = invariants::run_battery(&state, &GuardConfig::default());
    for id in [
        "profile-json-contact-leak",
        "bounded-aggregation",
        "definer-search-path",
        "no-readable-code-generators",
        "rekey-lock-and-duplicate-check",
        "merge-lock-and-duplicate-check",
        "definer-tenancy-rewrite",
    ] {
        assert_eq!(status(&report, id), CheckStatus::Fail, "{}", id);
    }
}

#[test]
fn secret_tables_and_triggers() {
    let mut state = hardened();
    state.policies[6].using = Some("(auth.uid() = user_id)".into());
    state.tables[5].rls_enabled = false;
    state.triggers[0].function_body =
        "begin new.tenant_id := (select tenant_id from profiles where id = auth.uid()); return new; end;".into();

    let report = invariants::run_battery(&state, &GuardConfig::default());
    assert_eq!(status(&report, "secret-tables-locked"), CheckStatus::Fail);
    assert_eq!(status(&report, "rls-enabled"), CheckStatus::Fail);
    assert_eq!(status(&report, "trigger-tenancy-rewrite"), CheckStatus::Fail);
    let secret = report
        .checks
        .iter()
        .find(|c| c.id == "secret-tables-locked")
        .unwrap();
    assert_eq!(secret.findings.len(), 2);
}

#[test]
fn missing_directory_function_is_reported() {
    let mut state = hardened();
    state.functions.retain(|f| f.name != "search_public_profiles");
    let report = invariants::run_battery(&state, &GuardConfig::default());
    assert_eq!(status(&report, "public-directory-functions"), CheckStatus::Fail);
}
