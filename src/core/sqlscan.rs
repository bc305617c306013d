//! SQL fragment scanner for migration text.
//!
//! A `logos` lexer that understands the lexical structure that matters for
//! security linting: line and block comments (block comments nest), single
//! quoted strings, quoted identifiers and dollar-quoted bodies. Statements are
//! split at top-level semicolons, so a function body quoted with `$$ ... $$`
//! or written as `BEGIN ATOMIC ... END` always stays in one statement.
//!
//! On top of the token stream, [`classify`] recognises the handful of
//! statement shapes the linter inspects.

use crate::core::error::GuardError;
use logos::Logos;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Word,
    /// `"quoted identifier"`; text holds the unquoted name.
    QuotedIdent,
    /// `'string literal'` (including `E'...'`); text holds the raw literal.
    Str,
    /// Dollar-quoted string; text holds the body without delimiters.
    Dollar,
    Number,
    /// Single punctuation character or operator run.
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based line on which the token starts.
    pub line: usize,
}

impl Token {
    pub fn is_word(&self, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_punct(&self, p: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == p
    }

    /// Identifier text as PostgreSQL would fold it.
    pub fn ident(&self) -> String {
        match self.kind {
            TokenKind::QuotedIdent => self.text.clone(),
            _ => self.text.to_ascii_lowercase(),
        }
    }

    /// Body of a string-like token, for function bodies and literals.
    pub fn string_body(&self) -> Option<String> {
        match self.kind {
            TokenKind::Dollar => Some(self.text.clone()),
            TokenKind::Str => {
                let raw = self.text.trim_start_matches(['E', 'e']);
                let inner = raw.strip_prefix('\'')?.strip_suffix('\'')?;
                Some(inner.replace("''", "'"))
            }
            _ => None,
        }
    }
}

/// Lexer failure. `Unexpected` is what logos reports for input no rule matches.
#[derive(Debug, Clone, Default, PartialEq)]
enum LexError {
    #[default]
    Unexpected,
    Unterminated(&'static str),
}

const OPERATOR_CHARS: &[u8] = b"+-*/<>=~!@#%^&|`?:";

/// Raw lexemes. Comments are real tokens here so [`strip_comments`] can blank
/// them; [`tokenize`] drops them.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexError)]
#[logos(skip r"\s+")]
enum Lexeme {
    #[regex(r"--[^\n]*")]
    LineComment,

    #[token("/*", block_comment)]
    BlockComment,

    #[regex(r"[\p{L}_][\p{L}\p{N}_$]*")]
    Word,

    #[token("\"", quoted_ident)]
    QuotedIdent(String),

    #[token("'", string_literal)]
    #[regex(r"[Ee]'", string_literal)]
    Str,

    #[regex(r"\$([A-Za-z_][A-Za-z0-9_]*)?\$", dollar_body)]
    Dollar(String),

    #[regex(r"[0-9][0-9.]*")]
    Number,

    #[regex(r"[(),;\[\].]")]
    Punct,

    #[regex(r"[+\-*/<>=~!@#%^&|`?:]", operator_run)]
    Operator,
}

/// Nested `/* ... */`; the opening delimiter is already consumed.
fn block_comment(lex: &mut logos::Lexer<Lexeme>) -> Result<(), LexError> {
    let rest = lex.remainder().as_bytes();
    let mut depth = 1usize;
    let mut i = 0;
    while i < rest.len() {
        if rest[i..].starts_with(b"/*") {
            depth += 1;
            i += 2;
        } else if rest[i..].starts_with(b"*/") {
            depth -= 1;
            i += 2;
            if depth == 0 {
                lex.bump(i);
                return Ok(());
            }
        } else {
            i += 1;
        }
    }
    lex.bump(rest.len());
    Err(LexError::Unterminated("block comment"))
}

/// Length up to and including the closing `quote`. A doubled quote is an
/// escaped quote; `backslash` enables `E'...'` escapes.
fn closing_quote(rest: &str, quote: u8, backslash: bool) -> Option<usize> {
    let bytes = rest.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if backslash && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn string_literal(lex: &mut logos::Lexer<Lexeme>) -> Result<(), LexError> {
    let escaped = lex.slice().len() > 1;
    let rest = lex.remainder();
    match closing_quote(rest, b'\'', escaped) {
        Some(len) => {
            lex.bump(len);
            Ok(())
        }
        None => {
            lex.bump(rest.len());
            Err(LexError::Unterminated("string literal"))
        }
    }
}

fn quoted_ident(lex: &mut logos::Lexer<Lexeme>) -> Result<String, LexError> {
    let rest = lex.remainder();
    match closing_quote(rest, b'"', false) {
        Some(len) => {
            let name = rest[..len - 1].replace("\"\"", "\"");
            lex.bump(len);
            Ok(name)
        }
        None => {
            lex.bump(rest.len());
            Err(LexError::Unterminated("quoted identifier"))
        }
    }
}

/// `$tag$ ... $tag$`; the token text is the body between the delimiters.
fn dollar_body(lex: &mut logos::Lexer<Lexeme>) -> Result<String, LexError> {
    let tag = lex.slice().to_string();
    let rest = lex.remainder();
    match rest.find(&tag) {
        Some(close) => {
            let body = rest[..close].to_string();
            lex.bump(close + tag.len());
            Ok(body)
        }
        None => {
            lex.bump(rest.len());
            Err(LexError::Unterminated("dollar-quoted string"))
        }
    }
}

/// Extends a single operator character into a run (`::`, `->>`, `<>`),
/// stopping where a comment begins.
fn operator_run(lex: &mut logos::Lexer<Lexeme>) {
    let rest = lex.remainder().as_bytes();
    let mut len = 0;
    while len < rest.len() && OPERATOR_CHARS.contains(&rest[len]) {
        if rest[len..].starts_with(b"--") || rest[len..].starts_with(b"/*") {
            break;
        }
        len += 1;
    }
    lex.bump(len);
}

/// Tracks the 1-based line of each span start as the lexer advances.
struct LineCounter<'a> {
    source: &'a str,
    offset: usize,
    line: usize,
}

impl<'a> LineCounter<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            offset: 0,
            line: 1,
        }
    }

    fn at(&mut self, position: usize) -> usize {
        self.line += self.source[self.offset..position].matches('\n').count();
        self.offset = position;
        self.line
    }
}

/// Tokenize SQL text. Comments are dropped; every token keeps its line.
pub fn tokenize(text: &str) -> Result<Vec<Token>, GuardError> {
    let mut lex = Lexeme::lexer(text);
    let mut lines = LineCounter::new(text);
    let mut tokens = Vec::new();

    while let Some(lexeme) = lex.next() {
        let span = lex.span();
        let line = lines.at(span.start);
        let (kind, text) = match lexeme {
            Ok(Lexeme::LineComment | Lexeme::BlockComment) => continue,
            Ok(Lexeme::Word) => (TokenKind::Word, lex.slice().to_string()),
            Ok(Lexeme::QuotedIdent(name)) => (TokenKind::QuotedIdent, name),
            Ok(Lexeme::Str) => (TokenKind::Str, lex.slice().to_string()),
            Ok(Lexeme::Dollar(body)) => (TokenKind::Dollar, body),
            Ok(Lexeme::Number) => (TokenKind::Number, lex.slice().to_string()),
            Ok(Lexeme::Punct | Lexeme::Operator) | Err(LexError::Unexpected) => {
                (TokenKind::Punct, lex.slice().to_string())
            }
            Err(LexError::Unterminated(what)) => {
                return Err(GuardError::Parse(format!(
                    "unterminated {} starting on line {}",
                    what, line
                )));
            }
        };
        tokens.push(Token { kind, text, line });
    }

    Ok(tokens)
}

/// Comment-free view of a script: comments are replaced by whitespace so line
/// numbers of the remaining text are unchanged. The input is not modified.
pub fn strip_comments(text: &str) -> String {
    let mut lex = Lexeme::lexer(text);
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;

    while let Some(lexeme) = lex.next() {
        let span = lex.span();
        let is_comment = matches!(
            lexeme,
            Ok(Lexeme::LineComment | Lexeme::BlockComment)
                | Err(LexError::Unterminated("block comment"))
        );
        if is_comment {
            out.push_str(&text[copied..span.start]);
            out.extend(
                text[span.clone()]
                    .chars()
                    .map(|c| if c == '\n' { '\n' } else { ' ' }),
            );
            copied = span.end;
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// One top-level statement: its tokens without the terminating `;`.
#[derive(Debug, Clone)]
pub struct Statement {
    pub tokens: Vec<Token>,
    pub line: usize,
}

impl Statement {
    /// Canonical single-line text: unquoted words lowercased, literals kept,
    /// single spaces between tokens. Suitable for pattern matching and hashing.
    pub fn normalized(&self) -> String {
        normalize_tokens(&self.tokens)
    }
}

/// Split at top-level semicolons. Inside a `BEGIN ATOMIC ... END` routine
/// body, semicolons belong to the body; `CASE ... END` pairs nest in it.
pub fn split_statements(tokens: Vec<Token>) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut depth = 0i32;
    let mut atomic = 0usize;
    let mut tokens = tokens.into_iter().peekable();
    while let Some(token) = tokens.next() {
        if token.kind == TokenKind::Word {
            if token.is_word("begin") && tokens.peek().is_some_and(|t| t.is_word("atomic")) {
                atomic += 1;
            } else if atomic > 0 && token.is_word("case") {
                atomic += 1;
            } else if atomic > 0 && token.is_word("end") {
                atomic -= 1;
            }
        }
        if token.kind == TokenKind::Punct {
            match token.text.as_str() {
                "(" => depth += 1,
                ")" => depth -= 1,
                ";" if depth <= 0 && atomic == 0 => {
                    if let Some(first) = current.first() {
                        let line = first.line;
                        statements.push(Statement {
                            tokens: std::mem::take(&mut current),
                            line,
                        });
                    }
                    depth = 0;
                    continue;
                }
                _ => {}
            }
        }
        current.push(token);
    }
    if let Some(first) = current.first() {
        let line = first.line;
        statements.push(Statement {
            tokens: current,
            line,
        });
    }
    statements
}

/// Tokenize and split in one step.
pub fn parse_statements(text: &str) -> Result<Vec<Statement>, GuardError> {
    Ok(split_statements(tokenize(text)?))
}

pub fn normalize_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (idx, token) in tokens.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        match token.kind {
            TokenKind::Word => out.push_str(&token.text.to_ascii_lowercase()),
            TokenKind::QuotedIdent => {
                out.push('"');
                out.push_str(&token.text);
                out.push('"');
            }
            TokenKind::Dollar => {
                out.push_str("$$");
                out.push_str(&token.text);
                out.push_str("$$");
            }
            _ => out.push_str(&token.text),
        }
    }
    out
}

/// Whitespace- and comment-insensitive normal form of an arbitrary SQL fragment.
/// Falls back to whitespace collapsing when the fragment does not tokenize.
pub fn normalize_fragment(text: &str) -> String {
    match tokenize(text) {
        Ok(tokens) => normalize_tokens(&tokens),
        Err(_) => text.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

// ---------------------------------------------------------------------------
// Statement classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn display(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBlock {
    pub name: QualifiedName,
    /// Argument list as written, normalized.
    pub args: String,
    /// Normalized `RETURNS` clause, e.g. `setof public.profiles`.
    pub returns: String,
    pub security_definer: bool,
    /// `SET <param> ...` clauses in the header, parameter names lowercased.
    pub set_params: Vec<String>,
    pub language: Option<String>,
    /// Delimited body text (content of the `AS` string), if present.
    pub body: Option<String>,
    pub body_line: usize,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStatement {
    pub name: String,
    pub table: QualifiedName,
    /// `select`, `insert`, `update`, `delete` or `all` (default).
    pub command: String,
    pub roles: Vec<String>,
    pub using: Option<String>,
    pub with_check: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    CreateFunction(FunctionBlock),
    CreatePolicy(PolicyStatement),
    DropPolicy {
        name: String,
        table: QualifiedName,
    },
    AlterFunctionSet {
        name: QualifiedName,
        params: Vec<String>,
    },
    AlterTableRls {
        table: QualifiedName,
        /// `enable`, `disable`, `force` or `no force`
        action: String,
    },
    CreateTable {
        table: QualifiedName,
    },
    Grant,
    SetRole,
    Other,
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_word(word)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_words(&mut self, words: &[&str]) -> bool {
        let save = self.pos;
        for word in words {
            if !self.eat_word(word) {
                self.pos = save;
                return false;
            }
        }
        true
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.peek().is_some_and(|t| t.is_punct(p)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn qualified_name(&mut self) -> Option<QualifiedName> {
        let first = self.next()?;
        if !matches!(first.kind, TokenKind::Word | TokenKind::QuotedIdent) {
            return None;
        }
        if self.eat_punct(".") {
            let second = self.next()?;
            Some(QualifiedName {
                schema: Some(first.ident()),
                name: second.ident(),
            })
        } else {
            Some(QualifiedName {
                schema: None,
                name: first.ident(),
            })
        }
    }

    /// Consume a balanced parenthesised group; returns the tokens inside.
    fn paren_group(&mut self) -> Option<&'a [Token]> {
        if !self.eat_punct("(") {
            return None;
        }
        let start = self.pos;
        let mut depth = 1;
        while let Some(token) = self.next() {
            if token.is_punct("(") {
                depth += 1;
            } else if token.is_punct(")") {
                depth -= 1;
                if depth == 0 {
                    return Some(&self.tokens[start..self.pos - 1]);
                }
            }
        }
        None
    }
}

pub fn classify(statement: &Statement) -> StatementKind {
    let mut cur = Cursor::new(&statement.tokens);

    if cur.eat_word("create") {
        cur.eat_words(&["or", "replace"]);
        if cur.eat_word("function") || cur.eat_word("procedure") {
            return parse_function(&mut cur, statement.line)
                .map(StatementKind::CreateFunction)
                .unwrap_or(StatementKind::Other);
        }
        if cur.eat_word("policy") {
            return parse_policy(&mut cur, statement.line)
                .map(StatementKind::CreatePolicy)
                .unwrap_or(StatementKind::Other);
        }
        cur.eat_word("unlogged");
        if cur.eat_word("table") {
            cur.eat_words(&["if", "not", "exists"]);
            return cur
                .qualified_name()
                .map(|table| StatementKind::CreateTable { table })
                .unwrap_or(StatementKind::Other);
        }
        return StatementKind::Other;
    }

    if cur.eat_word("drop") && cur.eat_word("policy") {
        cur.eat_words(&["if", "exists"]);
        let Some(name) = cur.next().map(Token::ident) else {
            return StatementKind::Other;
        };
        if !cur.eat_word("on") {
            return StatementKind::Other;
        }
        return cur
            .qualified_name()
            .map(|table| StatementKind::DropPolicy { name, table })
            .unwrap_or(StatementKind::Other);
    }

    cur = Cursor::new(&statement.tokens);
    if cur.eat_word("alter") {
        if cur.eat_word("function") || cur.eat_word("procedure") {
            let Some(name) = cur.qualified_name() else {
                return StatementKind::Other;
            };
            cur.paren_group();
            let mut params = Vec::new();
            while let Some(token) = cur.next() {
                if token.is_word("set") {
                    if let Some(param) = cur.next() {
                        params.push(param.ident());
                    }
                }
            }
            return StatementKind::AlterFunctionSet { name, params };
        }
        if cur.eat_word("table") {
            cur.eat_words(&["if", "exists"]);
            cur.eat_word("only");
            let Some(table) = cur.qualified_name() else {
                return StatementKind::Other;
            };
            let rest = normalize_tokens(&statement.tokens[cur.pos..]);
            let action = if rest.contains("disable row level security") {
                "disable"
            } else if rest.contains("no force row level security") {
                "no force"
            } else if rest.contains("enable row level security") {
                "enable"
            } else if rest.contains("force row level security") {
                "force"
            } else {
                return StatementKind::Other;
            };
            return StatementKind::AlterTableRls {
                table,
                action: action.to_string(),
            };
        }
        return StatementKind::Other;
    }

    cur = Cursor::new(&statement.tokens);
    if cur.eat_word("grant") {
        return StatementKind::Grant;
    }
    if cur.eat_word("set") {
        cur.eat_word("local");
        cur.eat_word("session");
        if cur.eat_word("role") {
            return StatementKind::SetRole;
        }
    }
    StatementKind::Other
}

fn parse_function(cur: &mut Cursor<'_>, line: usize) -> Option<FunctionBlock> {
    let name = cur.qualified_name()?;
    let args = normalize_tokens(cur.paren_group()?);

    let mut block = FunctionBlock {
        name,
        args,
        returns: String::new(),
        security_definer: false,
        set_params: Vec::new(),
        language: None,
        body: None,
        body_line: line,
        line,
    };

    while let Some(token) = cur.next() {
        if token.is_word("returns") {
            let start = cur.pos;
            if cur.eat_word("table") {
                cur.paren_group();
            } else {
                cur.eat_word("setof");
                cur.qualified_name();
                // array suffix / type modifiers
                while cur.peek().is_some_and(|t| t.is_punct("[") || t.is_punct("]")) {
                    cur.next();
                }
                if cur.peek().is_some_and(|t| t.is_punct("(")) {
                    cur.paren_group();
                }
            }
            block.returns = normalize_tokens(&cur.tokens[start..cur.pos]);
        } else if token.is_word("security") {
            if cur.eat_word("definer") {
                block.security_definer = true;
            } else {
                cur.eat_word("invoker");
            }
        } else if token.is_word("set") {
            if let Some(param) = cur.next() {
                block.set_params.push(param.ident());
            }
        } else if token.is_word("language") {
            block.language = cur.next().map(|t| match t.kind {
                TokenKind::Str => t.string_body().unwrap_or_default().to_ascii_lowercase(),
                _ => t.ident(),
            });
        } else if token.is_word("as") {
            if let Some(body_token) = cur.next() {
                block.body = body_token.string_body();
                block.body_line = body_token.line;
            }
        } else if token.is_word("begin") && cur.peek().is_some_and(|t| t.is_word("atomic")) {
            // SQL-standard body: runs to the end of the statement
            let rest = &cur.tokens[cur.pos + 1..];
            block.body = Some(normalize_tokens(rest));
            block.body_line = token.line;
            cur.pos = cur.tokens.len();
        } else if token.is_word("return") && block.body.is_none() {
            let rest = &cur.tokens[cur.pos..];
            block.body = Some(normalize_tokens(rest));
            block.body_line = token.line;
            cur.pos = cur.tokens.len();
        }
    }

    Some(block)
}

fn parse_policy(cur: &mut Cursor<'_>, line: usize) -> Option<PolicyStatement> {
    let name = cur.next()?.ident();
    if !cur.eat_word("on") {
        return None;
    }
    let table = cur.qualified_name()?;
    let mut policy = PolicyStatement {
        name,
        table,
        command: "all".to_string(),
        roles: Vec::new(),
        using: None,
        with_check: None,
        line,
    };

    while let Some(token) = cur.next() {
        if token.is_word("for") {
            if let Some(command) = cur.next() {
                policy.command = command.ident();
            }
        } else if token.is_word("to") {
            while let Some(role) = cur.peek() {
                if role.is_word("using") || role.is_word("with") {
                    break;
                }
                cur.next();
                if !role.is_punct(",") {
                    policy.roles.push(role.ident());
                }
            }
        } else if token.is_word("using") {
            policy.using = cur.paren_group().map(normalize_tokens);
        } else if token.is_word("with") && cur.eat_word("check") {
            policy.with_check = cur.paren_group().map(normalize_tokens);
        }
    }

    Some(policy)
}
