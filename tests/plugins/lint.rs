use rlsguard::core::config::GuardConfig;
use rlsguard::core::finding::{Finding, Severity};
use rlsguard::plugins::lint::{
    self, InputSelection, MigrationScript, RULE_DEFINER_SEARCH_PATH, RULE_DEFINER_SELECT_STAR,
    RULE_DROP_WITHOUT_REPLACEMENT, RULE_PARSE_ERROR, RULE_POLICY_USING_TRUE,
};
use std::fs;
use tempfile::tempdir;

fn lint(text: &str) -> Vec<Finding> {
    lint::lint_script(
        &MigrationScript::new("20260101000000_test.sql", text),
        &GuardConfig::default(),
    )
}

fn count(findings: &[Finding], rule: &str) -> usize {
    findings.iter().filter(|f| f.rule == rule).count()
}

#[test]
fn select_policy_using_true_is_exactly_one_error() {
    let findings = lint(
        "CREATE POLICY \"Anyone can read\" ON public.profiles\n  FOR SELECT USING (true);",
    );
    assert_eq!(count(&findings, RULE_POLICY_USING_TRUE), 1);
    let finding = findings
        .iter()
        .find(|f| f.rule == RULE_POLICY_USING_TRUE)
        .unwrap();
    assert_eq!(finding.severity, Severity::Error);
    assert_eq!(finding.location.as_ref().unwrap().line, Some(1));
}

#[test]
fn using_true_on_other_commands_is_tolerated_or_warned() {
    let insert = lint(
        "create policy \"insert own\" on public.posts for insert to authenticated with check (true);",
    );
    assert_eq!(count(&insert, RULE_POLICY_USING_TRUE), 0);

    let update = lint("create policy \"edit\" on public.posts for update using (true);");
    let hits: Vec<_> = update
        .iter()
        .filter(|f| f.rule == RULE_POLICY_USING_TRUE)
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].severity, Severity::Warning);
}

const TWO_FUNCTIONS: &str = r#"
create or replace function public.safe_lookup(p_id uuid)
returns text
language plpgsql
security definer
set search_path = public, pg_temp
as $$
begin
  return (select display_name from public.profiles where id = p_id);
end;
$$;

create or replace function public.unsafe_lookup(p_id uuid)
returns text
language plpgsql
security definer
as $$
begin
  -- set search_path = public is only a comment here
  return (select display_name from profiles where id = p_id);
end;
$$;
"#;

#[test]
fn search_path_in_another_function_does_not_suppress() {
    let findings = lint(TWO_FUNCTIONS);
    let hits: Vec<_> = findings
        .iter()
        .filter(|f| f.rule == RULE_DEFINER_SEARCH_PATH)
        .collect();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].message.contains("public.unsafe_lookup"));
}

#[test]
fn alter_function_set_search_path_counts_for_that_function() {
    let text = "create function public.f() returns void language sql security definer as $$ select 1 $$;\n\
                alter function public.f() set search_path = public;";
    assert_eq!(count(&lint(text), RULE_DEFINER_SEARCH_PATH), 0);
}

#[test]
fn select_star_inside_definer_body_is_flagged() {
    let text = "create function public.dump() returns setof record language sql security definer \
                set search_path = public as $$ select p.* from public.profiles p $$;";
    assert_eq!(count(&lint(text), RULE_DEFINER_SELECT_STAR), 1);

    let counted = "create function public.n() returns bigint language sql security definer \
                   set search_path = public as $$ select count(*) from public.profiles $$;";
    assert_eq!(count(&lint(counted), RULE_DEFINER_SELECT_STAR), 0);
}

#[test]
fn sql_standard_definer_bodies_are_inspected() {
    let text = "create function public.dump() returns setof public.profiles language sql\n\
                security definer set search_path = public\n\
                begin atomic\n  select * from public.profiles;\nend;";
    let findings = lint(text);
    assert_eq!(count(&findings, RULE_DEFINER_SELECT_STAR), 1);
    assert_eq!(count(&findings, RULE_DEFINER_SEARCH_PATH), 0);
    assert_eq!(count(&findings, RULE_PARSE_ERROR), 0);
    let star = findings
        .iter()
        .find(|f| f.rule == RULE_DEFINER_SELECT_STAR)
        .unwrap();
    assert_eq!(star.location.as_ref().unwrap().line, Some(3));

    let unpinned = "create function public.dump() returns setof public.profiles language sql \
                    security definer begin atomic select id from public.profiles; end;";
    assert_eq!(count(&lint(unpinned), RULE_DEFINER_SEARCH_PATH), 1);
}

#[test]
fn drop_policy_pairs_with_create_on_same_table() {
    let replaced = lint(
        "drop policy if exists \"old read\" on public.messages;\n\
         create policy \"new read\" on public.messages for select using (auth.uid() = sender_id);",
    );
    assert_eq!(count(&replaced, RULE_DROP_WITHOUT_REPLACEMENT), 0);

    let dropped = lint(
        "drop policy \"old read\" on public.messages;\n\
         create policy \"new read\" on public.posts for select using (auth.uid() = user_id);",
    );
    assert_eq!(count(&dropped, RULE_DROP_WITHOUT_REPLACEMENT), 1);
}

#[test]
fn linting_is_deterministic() {
    let text = format!(
        "{}\ngrant all on table public.profiles to anon;\nalter table public.profiles disable row level security;",
        TWO_FUNCTIONS
    );
    let first = lint(&text);
    let second = lint(&text);
    assert!(!first.is_empty());
    let key = |f: &Finding| {
        (
            f.rule.clone(),
            f.message.clone(),
            f.location.as_ref().and_then(|l| l.line),
        )
    };
    assert_eq!(
        first.iter().map(key).collect::<Vec<_>>(),
        second.iter().map(key).collect::<Vec<_>>()
    );
}

#[test]
fn corpus_is_linted_in_file_name_order_and_parse_errors_stay_local() {
    let tmp = tempdir().unwrap();
    let dir = tmp.path().join("supabase/migrations");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("20260201000000_b.sql"),
        "create policy \"r\" on public.tags for select using (true);",
    )
    .unwrap();
    fs::write(dir.join("20260101000000_a.sql"), "select 'unterminated;").unwrap();
    fs::write(dir.join("README.md"), "not sql").unwrap();

    let config = GuardConfig::load(tmp.path(), None).unwrap();
    let scripts = lint::collect_scripts(&config, &InputSelection::Corpus, tmp.path()).unwrap();
    let ids: Vec<_> = scripts.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["20260101000000_a.sql", "20260201000000_b.sql"]);

    let report = lint::lint_scripts(&scripts, &config);
    assert_eq!(count(&report.findings, RULE_PARSE_ERROR), 1);
    assert_eq!(count(&report.findings, RULE_POLICY_USING_TRUE), 1);
    assert!(report.verdict().is_err());
}

#[test]
fn missing_migrations_directory_is_fatal() {
    let tmp = tempdir().unwrap();
    let config = GuardConfig::load(tmp.path(), None).unwrap();
    assert!(lint::run_lint(&config, &InputSelection::Corpus, tmp.path()).is_err());
}
