use rlsguard::core::catalog::{CatalogState, FunctionDef};
use rlsguard::core::config::GuardConfig;
use rlsguard::core::error::GuardError;
use rlsguard::core::finding::Severity;
use rlsguard::plugins::registry::{
    self, RULE_PII_MISMATCH, RULE_POSSIBLY_REMOVED, RULE_UNREGISTERED, Registry, RegistryEntry,
};
use std::fs;
use tempfile::tempdir;

fn definer(name: &str, body: &str) -> FunctionDef {
    FunctionDef {
        schema: "public".into(),
        name: name.into(),
        args: "p_id uuid".into(),
        returns: Some("json".into()),
        security_definer: true,
        config: vec!["search_path=public".into()],
        body: body.into(),
        language: "plpgsql".into(),
    }
}

fn entry(pii_access: bool) -> RegistryEntry {
    RegistryEntry {
        purpose: "public card for profile pages".into(),
        pii_access,
        justification: "anon callers cannot read profiles directly".into(),
        owner: "platform".into(),
        added: "2026-03-01".into(),
    }
}

fn state(functions: Vec<FunctionDef>) -> CatalogState {
    CatalogState {
        functions,
        ..Default::default()
    }
}

#[test]
fn one_unregistered_function_fails_enforcement() {
    let live = state(vec![
        definer("get_public_profile", "select display_name from profiles"),
        definer("search_public_profiles", "select display_name from profiles"),
    ]);
    let mut entries = Registry::new();
    entries.insert("get_public_profile".into(), entry(false));

    let report = registry::reconcile(&live, &entries, &GuardConfig::default(), false);
    let unregistered: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.rule == RULE_UNREGISTERED)
        .collect();
    assert_eq!(unregistered.len(), 1);
    assert_eq!(unregistered[0].severity, Severity::Error);
    assert!(unregistered[0].message.contains("search_public_profiles"));
    assert!(matches!(report.verdict(), Err(GuardError::GateFailed(1))));
}

#[test]
fn discover_prints_one_scaffold_and_passes() {
    let live = state(vec![definer(
        "export_contacts",
        "select email, phone from profiles where id = p_id",
    )]);
    let report = registry::reconcile(&live, &Registry::new(), &GuardConfig::default(), true);
    assert!(report.verdict().is_ok());
    assert_eq!(report.notes.len(), 1);

    let scaffold: serde_json::Value = serde_json::from_str(&report.notes[0]).unwrap();
    let body = &scaffold["export_contacts"];
    assert_eq!(body["pii_access"], true);
    assert_eq!(body["purpose"], "");
    assert_eq!(body["added"].as_str().unwrap().len(), 10);
}

#[test]
fn stale_entries_are_warnings() {
    let mut entries = Registry::new();
    entries.insert("dropped_helper".into(), entry(false));
    let report = registry::reconcile(&state(vec![]), &entries, &GuardConfig::default(), false);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].rule, RULE_POSSIBLY_REMOVED);
    assert_eq!(report.findings[0].severity, Severity::Warning);
    assert!(report.verdict().is_ok());
}

#[test]
fn undeclared_pii_access_is_an_error_unless_allowlisted() {
    let body = "select json_build_object('email', email) from profiles where id = auth.uid()";
    let live = state(vec![
        definer("get_public_profile", body),
        definer("get_my_profile", body),
    ]);
    let mut entries = Registry::new();
    entries.insert("get_public_profile".into(), entry(false));
    entries.insert("get_my_profile".into(), entry(false));

    let report = registry::reconcile(&live, &entries, &GuardConfig::default(), false);
    let mismatches: Vec<_> = report
        .findings
        .iter()
        .filter(|f| f.rule == RULE_PII_MISMATCH)
        .collect();
    assert_eq!(mismatches.len(), 1);
    assert!(mismatches[0].message.contains("get_public_profile"));
    assert!(mismatches[0].message.contains("email"));

    entries.insert("get_public_profile".into(), entry(true));
    let report = registry::reconcile(&live, &entries, &GuardConfig::default(), false);
    assert!(report.findings.is_empty());
}

#[test]
fn overloads_share_one_entry() {
    let mut second = definer("lookup", "select 1");
    second.args = "p_handle text".into();
    let live = state(vec![definer("lookup", "select 1"), second]);
    let report = registry::reconcile(&live, &Registry::new(), &GuardConfig::default(), false);
    assert_eq!(report.findings.len(), 1);
}

#[test]
fn registry_document_is_read_from_disk() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("definer-registry.json");
    fs::write(
        &path,
        r#"{
  "get_public_profile": {
    "purpose": "public card",
    "pii_access": false,
    "justification": "read-only projection",
    "owner": "platform",
    "added": "2026-03-01"
  }
}"#,
    )
    .unwrap();
    let entries = registry::read_registry(&path, false).unwrap();
    assert_eq!(entries["get_public_profile"].owner, "platform");

    fs::write(&path, "[]").unwrap();
    assert!(matches!(
        registry::read_registry(&path, false),
        Err(GuardError::Parse(_))
    ));
}
