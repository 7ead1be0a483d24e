// Statement classification and query-string handling
//
// The proxy never parses SQL beyond recognizing an insertable shape:
// a case-insensitive `INSERT INTO <table> ... VALUES ...` statement, or an
// `INSERT INTO <table> ... FORMAT <name>` header with row data following.
// Anything else is pass-through, so unrecognized traffic is safe by default.

/// How buffered row fragments are joined back into one batch statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// `VALUES` tuples: fragments concatenate directly, `(1)(2)`.
    Values,
    /// `FORMAT <name>` row data: fragments join with newlines.
    Lines,
}

impl RowFormat {
    pub fn separator(&self) -> &'static str {
        match self {
            RowFormat::Values => "",
            RowFormat::Lines => "\n",
        }
    }
}

/// A recognized, bufferable insert statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    /// Destination table token, the collector's grouping key.
    pub table: String,
    /// Routed query string for delivery: `query=<prefix>` plus any
    /// pass-through parameters (database, user, password).
    pub params: String,
    /// Row fragments, newline-delimited within one push.
    pub content: String,
    pub format: RowFormat,
}

/// Classification result for one inbound statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Insert(InsertStatement),
    PassThrough,
}

/// Classify an inbound request into a bufferable insert or a pass-through.
///
/// The statement text comes from the `query=` parameter when present
/// (row data then arrives in the body), otherwise from the body itself.
pub fn parse_query(query_string: &str, body: &str) -> Classified {
    let (query_param, rest_params) = extract_query_param(query_string);

    let (statement, body_rows) = match &query_param {
        Some(stmt) => (stmt.as_str(), body),
        None => (body, ""),
    };

    let statement = statement.trim();
    let Some(after_insert) = strip_insert_into(statement) else {
        return Classified::PassThrough;
    };

    let Some(table) = extract_table(after_insert) else {
        return Classified::PassThrough;
    };

    if let Some(end) = find_keyword(statement, "values") {
        let prefix = statement[..end].trim_end();
        let inline = statement[end..].trim();
        let extra = body_rows.trim();
        let content = match (inline.is_empty(), extra.is_empty()) {
            (false, false) => format!("{inline}\n{extra}"),
            (false, true) => inline.to_string(),
            (true, false) => extra.to_string(),
            (true, true) => return Classified::PassThrough,
        };
        return Classified::Insert(InsertStatement {
            table,
            params: routed_params(prefix, &rest_params),
            content,
            format: RowFormat::Values,
        });
    }

    if find_keyword(statement, "format").is_some() {
        // FORMAT-style inserts carry rows in the body, or after the first
        // newline when the whole statement arrived in the body.
        let (prefix, rows) = if query_param.is_some() {
            (statement, body_rows.trim())
        } else {
            match statement.split_once('\n') {
                Some((head, tail)) => (head.trim_end(), tail.trim()),
                None => (statement, ""),
            }
        };
        if rows.is_empty() {
            return Classified::PassThrough;
        }
        return Classified::Insert(InsertStatement {
            table,
            params: routed_params(prefix, &rest_params),
            content: rows.to_string(),
            format: RowFormat::Lines,
        });
    }

    Classified::PassThrough
}

fn routed_params(prefix: &str, rest: &str) -> String {
    if rest.is_empty() {
        format!("query={}", percent_encode(prefix))
    } else {
        format!("query={}&{}", percent_encode(prefix), rest)
    }
}

/// Split the `query=` parameter out of a raw query string, returning the
/// decoded statement (if any) and the remaining parameters verbatim.
fn extract_query_param(query_string: &str) -> (Option<String>, String) {
    let mut statement = None;
    let mut rest = Vec::new();
    for pair in query_string.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.strip_prefix("query=") {
            Some(value) if statement.is_none() => statement = Some(percent_decode(value)),
            _ => rest.push(pair),
        }
    }
    (statement, rest.join("&"))
}

/// Strip a leading `INSERT INTO`, tolerating any whitespace between the
/// two keywords, and return the remainder.
fn strip_insert_into(statement: &str) -> Option<&str> {
    let rest = strip_token_ci(statement, "insert")?;
    strip_token_ci(rest, "into")
}

fn strip_token_ci<'a>(s: &'a str, token: &str) -> Option<&'a str> {
    let s = s.trim_start();
    // A multibyte character straddling the boundary means no match.
    let prefix = s.get(..token.len())?;
    if !prefix.eq_ignore_ascii_case(token) {
        return None;
    }
    let rest = &s[token.len()..];
    if rest.chars().next().is_some_and(|c| !c.is_whitespace()) {
        return None;
    }
    Some(rest)
}

/// Destination table token: the word after `INSERT INTO`, stopping at
/// whitespace or an opening parenthesis, quoting stripped.
fn extract_table(after_insert: &str) -> Option<String> {
    let after = after_insert.trim_start();
    let end = after
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(after.len());
    let table = after[..end].trim_matches(|c| c == '`' || c == '"');
    if table.is_empty() {
        None
    } else {
        Some(table.to_string())
    }
}

/// Find a standalone keyword (case-insensitive, word boundaries on both
/// sides) and return the byte offset just past it.
fn find_keyword(statement: &str, keyword: &str) -> Option<usize> {
    let lower = statement.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = lower[from..].find(keyword) {
        let start = from + pos;
        let end = start + keyword.len();
        let before_ok = start == 0
            || lower[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_whitespace() || c == ')');
        let after_ok = end == lower.len()
            || lower[end..]
                .chars()
                .next()
                .is_some_and(|c| c.is_whitespace() || c == '(');
        if before_ok && after_ok {
            return Some(end);
        }
        from = end;
    }
    None
}

const UNRESERVED: &[u8] = b"-_.~";

/// Percent-encode a statement for use as a query-string value.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Decode a percent-encoded query-string value. `+` decodes to a space;
/// malformed escapes pass through unchanged.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let Some(hex) = s.get(i + 1..i + 3) {
                    if let Ok(byte) = u8::from_str_radix(hex, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(b'%');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
