use std::sync::OnceLock;

use regex::Regex;

// Postgres truncates identifiers past this many bytes.
pub const MAX_IDENT_LEN: usize = 63;

fn plain_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Table/schema names from config must be plain identifiers.
pub fn is_plain_ident(s: &str) -> bool {
    s.len() <= MAX_IDENT_LEN && plain_ident_re().is_match(s)
}

/// Quote an arbitrary identifier (record field names keep their case).
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Lowercased, underscore-only name derived from a dataset code, e.g. `bmrs_fuelinst`.
pub fn safe_table_name(prefix: &str, code: &str) -> String {
    let mut name = String::with_capacity(prefix.len() + code.len() + 1);
    name.push_str(prefix);
    name.push('_');
    for ch in code.chars() {
        if ch.is_ascii_alphanumeric() { name.push(ch.to_ascii_lowercase()); } else { name.push('_'); }
    }
    name
}
