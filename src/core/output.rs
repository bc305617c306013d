//! Report rendering for CLI surfaces.
//!
//! Text output is one `component: ...` line per check or finding, coloured by
//! severity; JSON output wraps the full report in the command envelope.

use crate::core::finding::{CheckOutcome, CheckStatus, Finding, Report, Severity};
use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

fn severity_label(severity: Severity) -> String {
    match severity {
        Severity::Error => "error".red().bold().to_string(),
        Severity::Warning => "warning".yellow().bold().to_string(),
        Severity::Info => "info".cyan().to_string(),
    }
}

fn status_label(status: CheckStatus) -> String {
    match status {
        CheckStatus::Pass => "pass".green().bold().to_string(),
        CheckStatus::Warn => "warn".yellow().bold().to_string(),
        CheckStatus::Fail => "FAIL".red().bold().to_string(),
        CheckStatus::Skip => "skip".dimmed().to_string(),
    }
}

pub fn render_finding(component: &str, finding: &Finding) -> String {
    let mut line = format!(
        "{}: {} [{}] {}",
        component,
        severity_label(finding.severity),
        finding.rule,
        compact_line(&finding.message, 240)
    );
    if let Some(location) = &finding.location {
        line.push_str(&format!(" ({})", location));
    }
    if finding.before.is_some() || finding.after.is_some() {
        line.push_str(&format!(
            "\n{}:   before={} after={}",
            component,
            finding.before.as_deref().unwrap_or("-"),
            finding.after.as_deref().unwrap_or("-")
        ));
    }
    line
}

fn render_check(component: &str, check: &CheckOutcome) -> Vec<String> {
    let mut lines = vec![format!(
        "{}: {} {} {}",
        component,
        status_label(check.status),
        check.id,
        check.title.dimmed()
    )];
    for finding in &check.findings {
        if finding.severity > Severity::Info || check.status == CheckStatus::Skip {
            lines.push(format!("  {}", render_finding(component, finding)));
        }
    }
    lines
}

pub fn render_text(report: &Report) -> String {
    let component = report.component.as_str();
    let mut lines = Vec::new();
    for check in &report.checks {
        lines.extend(render_check(component, check));
    }
    for finding in &report.findings {
        lines.push(render_finding(component, finding));
    }
    for note in &report.notes {
        lines.push(note.clone());
    }
    let tally = report.tally();
    let verdict = if report.verdict().is_ok() {
        "ok".green().bold()
    } else {
        "failed".red().bold()
    };
    lines.push(format!(
        "{}: summary errors={} warnings={} info={} checks={} -> {}",
        component,
        tally.errors,
        tally.warnings,
        tally.infos,
        report.checks.len(),
        verdict
    ));
    lines.join("\n")
}

pub fn render_json(report: &Report) -> Result<String, serde_json::Error> {
    let status = if report.verdict().is_ok() { "ok" } else { "failed" };
    let envelope = crate::core::time::command_envelope(
        &report.component,
        status,
        serde_json::json!({
            "summary": report.tally(),
            "report": report,
        }),
    );
    serde_json::to_string_pretty(&envelope)
}

pub fn print_report(report: &Report, format: OutputFormat) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Text => println!("{}", render_text(report)),
        OutputFormat::Json => println!("{}", render_json(report)?),
    }
    Ok(())
}
