//! Row limit clause injection.

/// Appends ` fetch first N rows only` when `row_limit` is non-zero.
///
/// The clause is concatenated verbatim: trailing semicolons or an existing
/// limit clause are not detected, so callers must supply SQL that accepts a
/// trailing clause.
pub fn apply_limit(sql: &str, row_limit: u64) -> String {
    if row_limit == 0 {
        return sql.to_string();
    }
    format!("{sql} fetch first {row_limit} rows only")
}
