//! Predicate and body heuristics shared by the linter, the invariant checker,
//! the registry reconciler and the drift detector.
//!
//! These are keyword and allow-list heuristics over normalized SQL text. They
//! catch the common shapes (`auth.uid() = user_id`, `false`, `is_admin()`),
//! not every semantically equivalent predicate, so a clean result is
//! best-effort and the lists in `[heuristics]` need periodic human review.

use crate::core::config::GuardConfig;
use crate::core::sqlscan::{self, Token, TokenKind};
use regex::Regex;

/// How a policy predicate gates access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Compares against the caller's identity.
    Identity,
    /// Literal `false`.
    Deny,
    /// Administrator-capability check.
    Admin,
    /// Literal `true`.
    Unconditional,
    /// None of the above.
    Ungated,
}

impl Gate {
    /// Identity, explicit deny and admin gates all keep foreign rows out.
    pub fn is_isolating(self) -> bool {
        matches!(self, Gate::Identity | Gate::Deny | Gate::Admin)
    }
}

/// Normalized expression with redundant outer parentheses removed.
pub fn normalize_expr(expr: &str) -> String {
    let mut normalized = sqlscan::normalize_fragment(expr);
    while let Some(inner) = strip_outer_parens(&normalized) {
        normalized = inner;
    }
    normalized
}

fn strip_outer_parens(text: &str) -> Option<String> {
    let inner = text.strip_prefix("( ")?.strip_suffix(" )")?;
    // only strip when the leading paren closes at the very end
    let mut depth = 0i32;
    for part in inner.split(' ') {
        match part {
            "(" => depth += 1,
            ")" => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then(|| inner.to_string())
}

pub fn is_unconditional_true(expr: &str) -> bool {
    matches!(normalize_expr(expr).as_str(), "true" | "1 = 1" | "'t'")
}

pub fn is_explicit_deny(expr: &str) -> bool {
    matches!(normalize_expr(expr).as_str(), "false" | "1 = 0")
}

/// True when the predicate compares the caller's identity with something else:
/// a marker on one side of `=` (or the left of `IN`) with a column or
/// subquery on the other. Mere presence of a marker (`auth.uid() IS NOT NULL`)
/// admits every signed-in user and does not count.
pub fn references_identity(expr: &str, config: &GuardConfig) -> bool {
    let Ok(tokens) = sqlscan::tokenize(expr) else {
        return false;
    };
    let spans = identity_spans(&tokens, config);
    spans.iter().any(|&(start, end)| {
        let left = start
            .checked_sub(2)
            .filter(|_| tokens[start - 1].is_punct("="))
            .is_some_and(|idx| is_comparand_end(&tokens, idx, &spans));
        let right = tokens
            .get(end)
            .is_some_and(|t| t.is_punct("=") || t.is_word("in"))
            && is_comparand_start(&tokens, end + 1, &spans);
        left || right
    })
}

/// Token ranges covering each identity marker, widened over a trailing call
/// remainder, parentheses, `(select ...)` wrappers, casts and JSON field access.
fn identity_spans(tokens: &[Token], config: &GuardConfig) -> Vec<(usize, usize)> {
    let texts: Vec<String> = tokens.iter().map(token_text).collect();
    let mut spans = Vec::new();
    for marker in &config.heuristics.identity_markers {
        let Ok(needle) = sqlscan::tokenize(marker) else {
            continue;
        };
        let needle: Vec<String> = needle.iter().map(token_text).collect();
        if needle.is_empty() || needle.len() > texts.len() {
            continue;
        }
        for start in 0..=texts.len() - needle.len() {
            if texts[start..start + needle.len()] != needle[..] {
                continue;
            }
            let mut end = start + needle.len();
            // close any call the marker left open, e.g. current_setting('...', true)
            let mut depth: i32 = needle
                .iter()
                .map(|t| match t.as_str() {
                    "(" => 1,
                    ")" => -1,
                    _ => 0,
                })
                .sum();
            while depth > 0 && end < tokens.len() {
                if tokens[end].is_punct("(") {
                    depth += 1;
                } else if tokens[end].is_punct(")") {
                    depth -= 1;
                }
                end += 1;
            }
            let mut start = start;
            loop {
                if tokens.get(end).is_some_and(|t| t.is_punct("::")) && end + 1 < tokens.len() {
                    end += 2;
                } else if tokens
                    .get(end)
                    .is_some_and(|t| t.is_punct("->>") || t.is_punct("->"))
                    && end + 1 < tokens.len()
                {
                    end += 2;
                } else if start >= 2
                    && tokens[start - 1].is_word("select")
                    && tokens[start - 2].is_punct("(")
                    && tokens.get(end).is_some_and(|t| t.is_punct(")"))
                {
                    start -= 2;
                    end += 1;
                } else if start >= 1
                    && tokens[start - 1].is_punct("(")
                    && tokens.get(end).is_some_and(|t| t.is_punct(")"))
                {
                    start -= 1;
                    end += 1;
                } else {
                    break;
                }
            }
            spans.push((start, end));
        }
    }
    spans
}

fn token_text(token: &Token) -> String {
    match token.kind {
        TokenKind::Word => token.text.to_ascii_lowercase(),
        _ => token.text.clone(),
    }
}

fn is_literal(token: &Token) -> bool {
    matches!(token.kind, TokenKind::Str | TokenKind::Number | TokenKind::Dollar)
        || ["true", "false", "null"].iter().any(|w| token.is_word(w))
}

/// Does the operand beginning at `idx` name a column or an expression other
/// than another identity marker?
fn is_comparand_start(tokens: &[Token], idx: usize, spans: &[(usize, usize)]) -> bool {
    let Some(token) = tokens.get(idx) else {
        return false;
    };
    if spans.iter().any(|&(start, _)| start == idx) || is_literal(token) {
        return false;
    }
    matches!(token.kind, TokenKind::Word | TokenKind::QuotedIdent) || token.is_punct("(")
}

/// Does the operand ending at `idx` name a column or an expression other than
/// another identity marker?
fn is_comparand_end(tokens: &[Token], idx: usize, spans: &[(usize, usize)]) -> bool {
    let token = &tokens[idx];
    if spans.iter().any(|&(_, end)| end == idx + 1) || is_literal(token) {
        return false;
    }
    matches!(token.kind, TokenKind::Word | TokenKind::QuotedIdent) || token.is_punct(")")
}

pub fn is_admin_gate(expr: &str, config: &GuardConfig) -> bool {
    let normalized = normalize_expr(expr);
    config
        .heuristics
        .admin_markers
        .iter()
        .any(|marker| normalized.contains(&sqlscan::normalize_fragment(marker)))
}

/// Classify a predicate. A missing predicate (`None`) is treated as unconditional,
/// which is how the database evaluates an absent USING clause.
pub fn classify_gate(expr: Option<&str>, config: &GuardConfig) -> Gate {
    let Some(expr) = expr else {
        return Gate::Unconditional;
    };
    if is_unconditional_true(expr) {
        Gate::Unconditional
    } else if is_explicit_deny(expr) {
        Gate::Deny
    } else if references_identity(expr, config) {
        Gate::Identity
    } else if is_admin_gate(expr, config) {
        Gate::Admin
    } else {
        Gate::Ungated
    }
}

/// True when `name` matches the fixed self-access/auth/merge allow-list.
pub fn is_pii_allowlisted(name: &str, config: &GuardConfig) -> bool {
    config
        .heuristics
        .pii_allowlist
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(name))
}

fn word_regex(word: &str) -> Option<Regex> {
    let needle = regex::escape(&sqlscan::normalize_fragment(word));
    Regex::new(&format!(r"(^|[^a-z0-9_]){}($|[^a-z0-9_])", needle)).ok()
}

/// True when the normalized text mentions `word` as a whole identifier.
pub fn mentions(normalized: &str, word: &str) -> bool {
    word_regex(word).is_some_and(|re| re.is_match(normalized))
}

/// Sensitive columns referenced by a function body, in config order.
pub fn sensitive_columns_in(body: &str, columns: &[String]) -> Vec<String> {
    let normalized = sqlscan::normalize_fragment(body);
    columns
        .iter()
        .filter(|column| mentions(&normalized, column))
        .cloned()
        .collect()
}

/// Heuristic "touches sensitive data" flag for a function body.
pub fn touches_sensitive(body: &str, config: &GuardConfig) -> bool {
    !sensitive_columns_in(body, &config.schema.sensitive_columns).is_empty()
}

/// Does the body project unenumerated full rows (`SELECT *`, `SELECT t.*`)?
pub fn has_select_star(body: &str) -> bool {
    let Ok(tokens) = sqlscan::tokenize(body) else {
        let lowered = body.to_ascii_lowercase();
        return lowered.contains("select *") || lowered.contains(".*");
    };
    has_select_star_tokens(&tokens)
}

fn has_select_star_tokens(tokens: &[Token]) -> bool {
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_word("select") {
            let mut next = idx + 1;
            while tokens
                .get(next)
                .is_some_and(|t| t.is_word("distinct") || t.is_word("all"))
            {
                next += 1;
            }
            if tokens.get(next).is_some_and(|t| t.is_punct("*")) {
                return true;
            }
        }
        // alias.* anywhere in a projection
        if matches!(token.kind, TokenKind::Word | TokenKind::QuotedIdent)
            && tokens.get(idx + 1).is_some_and(|t| t.is_punct("."))
            && tokens.get(idx + 2).is_some_and(|t| t.is_punct("*"))
        {
            return true;
        }
    }
    false
}

/// Does the body set the search path itself?
pub fn body_sets_search_path(body: &str) -> bool {
    let normalized = sqlscan::normalize_fragment(body);
    normalized.contains("set search_path")
        || normalized.contains("set local search_path")
        || normalized.contains("set_config ( 'search_path'")
}

pub fn takes_advisory_xact_lock(body: &str) -> bool {
    let normalized = sqlscan::normalize_fragment(body);
    normalized.contains("pg_advisory_xact_lock") || normalized.contains("pg_try_advisory_xact_lock")
}

/// Identity locations not covered by an existence check in `body`.
/// Empty means the duplicate check spans every configured location.
pub fn missing_duplicate_checks(body: &str, locations: &[String]) -> Vec<String> {
    let normalized = sqlscan::normalize_fragment(body);
    let has_probe = normalized.contains("exists (")
        || normalized.contains("count (")
        || normalized.contains("if found");
    if !has_probe {
        return locations.to_vec();
    }
    locations
        .iter()
        .filter(|location| !mentions(&normalized, location))
        .cloned()
        .collect()
}

const AGGREGATES: [&str; 4] = ["array_agg", "json_agg", "jsonb_agg", "string_agg"];

/// True when some aggregate call has no `LIMIT` in the query that contains it
/// (its own subquery or statement, nested subqueries included).
pub fn aggregates_unbounded(body: &str) -> bool {
    let Ok(tokens) = sqlscan::tokenize(body) else {
        let normalized = sqlscan::normalize_fragment(body);
        return AGGREGATES.iter().any(|agg| normalized.contains(agg)) && !mentions(&normalized, "limit");
    };
    (0..tokens.len())
        .filter(|&idx| {
            AGGREGATES.iter().any(|agg| tokens[idx].is_word(agg))
                && tokens.get(idx + 1).is_some_and(|t| t.is_punct("("))
        })
        .any(|idx| {
            let (start, end) = enclosing_query(&tokens, idx);
            !tokens[start..end].iter().any(|t| t.is_word("limit"))
        })
}

/// Token range of the innermost `(select ...)` around `idx`, or of the
/// `;`-delimited statement when no subquery encloses it.
fn enclosing_query(tokens: &[Token], idx: usize) -> (usize, usize) {
    let mut start = 0;
    let mut subquery = false;
    let mut depth = 0usize;
    for j in (0..idx).rev() {
        let token = &tokens[j];
        if token.is_punct(")") {
            depth += 1;
        } else if token.is_punct("(") {
            if depth > 0 {
                depth -= 1;
            } else if tokens.get(j + 1).is_some_and(|t| t.is_word("select")) {
                start = j + 1;
                subquery = true;
                break;
            }
        } else if token.is_punct(";") && depth == 0 {
            start = j + 1;
            break;
        }
    }

    let mut depth = 0usize;
    for (k, token) in tokens.iter().enumerate().skip(idx) {
        if token.is_punct("(") {
            depth += 1;
        } else if token.is_punct(")") {
            if depth > 0 {
                depth -= 1;
            } else if subquery {
                return (start, k);
            }
        } else if token.is_punct(";") && depth == 0 && !subquery {
            return (start, k);
        }
    }
    (start, tokens.len())
}

pub fn builds_json(body: &str) -> bool {
    let normalized = sqlscan::normalize_fragment(body);
    [
        "json_build_object (",
        "jsonb_build_object (",
        "row_to_json (",
        "to_json (",
        "to_jsonb (",
        "json_agg (",
        "jsonb_agg (",
    ]
    .iter()
    .any(|f| normalized.contains(f))
}

/// Immutable columns a trigger body assigns through `NEW.<col> :=` or `NEW.<col> =`.
pub fn assigned_new_columns(body: &str, columns: &[String]) -> Vec<String> {
    let normalized = sqlscan::normalize_fragment(body);
    columns
        .iter()
        .filter(|column| {
            let col = regex::escape(&column.to_ascii_lowercase());
            // `=` is only an assignment at statement start; elsewhere it compares
            let patterns = [
                format!(r"new \. {} := ", col),
                format!(r"(^|; |begin |then |else |loop )new \. {} = ", col),
            ];
            patterns
                .iter()
                .any(|p| Regex::new(p).is_ok_and(|re| re.is_match(&normalized)))
        })
        .cloned()
        .collect()
}

/// Immutable columns a body rewrites with `UPDATE ... SET <col> =`.
pub fn updated_columns(body: &str, columns: &[String]) -> Vec<String> {
    let normalized = sqlscan::normalize_fragment(body);
    let Ok(re) = Regex::new(r"update [^;]*? set ([^;]*)") else {
        return Vec::new();
    };
    let mut hits = Vec::new();
    for caps in re.captures_iter(&normalized) {
        let assignments = &caps[1];
        for column in columns {
            let lowered = column.to_ascii_lowercase();
            if assignments.starts_with(&format!("{} =", lowered))
                || assignments.contains(&format!(", {} =", lowered))
            {
                if !hits.contains(column) {
                    hits.push(column.clone());
                }
            }
        }
    }
    hits
}
