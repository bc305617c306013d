use rlsguard::core::catalog::{CatalogState, FunctionDef, PolicyDefinition, TableRls};
use rlsguard::core::error::GuardError;
use rlsguard::core::finding::Severity;
use rlsguard::plugins::drift::{self, Snapshot};
use std::fs;
use tempfile::tempdir;

fn live_state() -> CatalogState {
    CatalogState {
        policies: vec![
            PolicyDefinition {
                schema: "public".into(),
                table: "profiles".into(),
                name: "Users read own profile".into(),
                command: "select".into(),
                permissive: true,
                roles: vec!["authenticated".into()],
                using: Some("(auth.uid() = id)".into()),
                with_check: None,
            },
            PolicyDefinition {
                schema: "public".into(),
                table: "messages".into(),
                name: "Participants read".into(),
                command: "select".into(),
                permissive: true,
                roles: vec!["authenticated".into()],
                using: Some("((auth.uid() = sender_id) OR (auth.uid() = recipient_id))".into()),
                with_check: None,
            },
        ],
        functions: vec![
            FunctionDef {
                schema: "public".into(),
                name: "get_my_profile".into(),
                args: String::new(),
                returns: Some("json".into()),
                security_definer: true,
                config: vec!["search_path=public".into()],
                body: "select row_to_json(p) from profiles p where p.id = auth.uid()".into(),
                language: "sql".into(),
            },
            FunctionDef {
                schema: "public".into(),
                name: "slugify".into(),
                args: "t text".into(),
                returns: Some("text".into()),
                security_definer: false,
                config: vec![],
                body: "select lower(t)".into(),
                language: "sql".into(),
            },
        ],
        tables: vec![
            TableRls {
                schema: "public".into(),
                table: "profiles".into(),
                rls_enabled: true,
                rls_forced: false,
            },
            TableRls {
                schema: "public".into(),
                table: "messages".into(),
                rls_enabled: true,
                rls_forced: true,
            },
        ],
        ..Default::default()
    }
}

#[test]
fn snapshot_covers_policies_privileged_functions_and_tables() {
    let snapshot = Snapshot::from_catalog(&live_state());
    assert_eq!(snapshot.summary.policies, 2);
    // only security definer functions are tracked
    assert_eq!(snapshot.summary.functions, 1);
    assert!(snapshot.functions.contains_key("public.get_my_profile()"));
    assert!(snapshot.policies.contains_key("public.profiles.Users read own profile"));
    assert!(snapshot.rls["public.messages"].forced);
}

#[test]
fn compare_twice_without_changes_is_empty_both_times() {
    let baseline = Snapshot::from_catalog(&live_state());
    for _ in 0..2 {
        let report = drift::compare(&baseline, &live_state());
        assert!(report.findings.is_empty());
        assert!(report.verdict().is_ok());
    }
}

#[test]
fn removals_are_errors_changes_warnings_additions_info() {
    let baseline = Snapshot::from_catalog(&live_state());
    let mut live = live_state();
    live.policies.remove(1);
    live.policies[0].using = Some("true".into());
    live.functions[0].security_definer = true;
    live.functions[1].security_definer = true;
    live.functions[0].body.push_str(" limit 1");

    let findings = drift::diff(&baseline, &Snapshot::from_catalog(&live));
    let severity_of = |rule: &str| {
        findings
            .iter()
            .find(|f| f.rule == rule)
            .map(|f| f.severity)
    };
    assert_eq!(severity_of("policy-removed"), Some(Severity::Error));
    assert_eq!(severity_of("policy-changed"), Some(Severity::Warning));
    assert_eq!(severity_of("function-changed"), Some(Severity::Warning));
    assert_eq!(severity_of("function-added"), Some(Severity::Info));
    assert_eq!(findings.len(), 4);
}

#[test]
fn whitespace_only_edits_are_not_drift() {
    let baseline = Snapshot::from_catalog(&live_state());
    let mut live = live_state();
    live.functions[0].body =
        "SELECT row_to_json(p)\n  FROM profiles p\n WHERE p.id = auth.uid() -- self only".into();
    assert!(drift::diff(&baseline, &Snapshot::from_catalog(&live)).is_empty());
}

#[test]
fn table_level_changes() {
    let baseline = Snapshot::from_catalog(&live_state());
    let mut live = live_state();
    live.tables.remove(0);
    live.tables.push(TableRls {
        schema: "public".into(),
        table: "audit_scratch".into(),
        rls_enabled: false,
        rls_forced: false,
    });
    let findings = drift::diff(&baseline, &Snapshot::from_catalog(&live));
    let rules: Vec<_> = findings.iter().map(|f| f.rule.as_str()).collect();
    assert_eq!(rules, vec!["table-removed", "table-added-without-rls"]);
    assert!(findings.iter().all(|f| f.severity == Severity::Warning));
}

#[test]
fn baseline_round_trips_through_disk_and_never_gates() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("security/policy-snapshot.json");
    let snapshot = Snapshot::from_catalog(&live_state());

    let report = drift::write_baseline(&path, &snapshot).unwrap();
    assert!(report.verdict().is_ok());
    assert!(report.notes[0].contains("2 policies"));

    let read = drift::read_baseline(&path).unwrap();
    assert_eq!(read, snapshot);
    assert!(drift::compare(&read, &live_state()).findings.is_empty());
}

#[test]
fn missing_or_foreign_baseline_is_fatal() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("policy-snapshot.json");
    let err = drift::read_baseline(&path).unwrap_err();
    assert!(matches!(err, GuardError::NotFound(_)));
    assert!(err.to_string().contains("--snapshot"));

    let mut value = serde_json::to_value(Snapshot::from_catalog(&live_state())).unwrap();
    value["version"] = serde_json::json!(99);
    fs::write(&path, value.to_string()).unwrap();
    assert!(matches!(
        drift::read_baseline(&path),
        Err(GuardError::Parse(_))
    ));

    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        drift::read_baseline(&path),
        Err(GuardError::Parse(_))
    ));
}
