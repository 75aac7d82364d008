// ABOUTME: PostgreSQL connection and SQL quoting utilities
// ABOUTME: Used wherever the tool issues statements directly instead of through pg_restore

pub mod connection;

pub use connection::connect;

/// Quotes an identifier the way `quote_ident` does.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quotes a string literal the way `quote_literal` does.
pub fn quote_literal(value: &str) -> String {
    if value.contains('\\') {
        format!("E'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}
