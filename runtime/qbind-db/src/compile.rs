//! Bind compiler: turns SQL text plus parameter descriptors into rewritten
//! SQL and a bind map.
//!
//! Placeholders are `:<name>` tokens. A token matches only when the next
//! character cannot continue an identifier and the colon is not part of a
//! `::` cast, so rewriting `:cat` leaves `:category` alone.
//!
//! Expanded parameters get one synthetic bind per comma-separated segment,
//! named `<name><uuid>`. Segments are taken literally (no trimming).

use indexmap::IndexMap;
use uuid::Uuid;

use crate::limit::apply_limit;
use crate::{BindValue, ParameterDescriptor, QueryError};

/// Bind name (without the leading colon) to coerced value, in insertion order.
pub type BindMap = IndexMap<String, BindValue>;

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledQuery {
    sql: String,
    binds: BindMap,
}

impl CompiledQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn binds(&self) -> &BindMap {
        &self.binds
    }

    pub fn with_row_limit(self, row_limit: u64) -> Self {
        Self {
            sql: apply_limit(&self.sql, row_limit),
            binds: self.binds,
        }
    }

    pub fn into_parts(self) -> (String, BindMap) {
        (self.sql, self.binds)
    }
}

/// Non-ASCII letters continue a name, as they do in SQLite parameter names.
pub(crate) fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '$' | '#')
}

/// Byte offsets of every boundary-respecting `:<name>` token in `sql`.
fn token_positions(sql: &str, name: &str) -> Vec<usize> {
    let token = format!(":{name}");
    let mut positions = Vec::new();
    let mut from = 0;
    while let Some(found) = sql[from..].find(&token) {
        let start = from + found;
        let end = start + token.len();
        let cast = sql[..start].ends_with(':');
        let continues = sql[end..].chars().next().is_some_and(is_ident_char);
        if !cast && !continues {
            positions.push(start);
        }
        from = start + 1;
    }
    positions
}

fn enclosed_in_parens(sql: &str, start: usize, end: usize) -> bool {
    sql[..start].trim_end().ends_with('(') && sql[end..].trim_start().starts_with(')')
}

/// Replaces every boundary occurrence of `:<name>` with the reference list.
/// Occurrences already wrapped in parentheses receive the bare list.
fn replace_token(sql: &str, name: &str, refs: &str) -> String {
    let token_len = name.len() + 1;
    let mut out = String::with_capacity(sql.len() + refs.len());
    let mut last = 0;
    for start in token_positions(sql, name) {
        let end = start + token_len;
        out.push_str(&sql[last..start]);
        if enclosed_in_parens(sql, start, end) {
            out.push_str(refs);
        } else {
            out.push('(');
            out.push_str(refs);
            out.push(')');
        }
        last = end;
    }
    out.push_str(&sql[last..]);
    out
}

fn synthetic_name(name: &str) -> String {
    format!("{name}{}", Uuid::new_v4().simple())
}

/// Compiles `sql` against `params`, in parameter order.
///
/// Duplicate parameter names are a caller error: a later duplicate sees the
/// text as already rewritten by the earlier one.
pub fn compile(sql: &str, params: &[ParameterDescriptor]) -> Result<CompiledQuery, QueryError> {
    let mut sql = sql.to_string();
    let mut binds = BindMap::with_capacity(params.len());
    for param in params {
        let name = param.name.as_str();
        if name.is_empty() {
            return Err(QueryError::binding(name, "parameter name is empty"));
        }
        if token_positions(&sql, name).is_empty() {
            return Err(QueryError::binding(
                name,
                format!("no placeholder ':{name}' in query"),
            ));
        }
        let raw = param.value.as_text();
        if !param.expand_as_list {
            binds.insert(param.name.clone(), param.data_type.coerce(name, &raw)?);
            continue;
        }

        let mut refs = Vec::new();
        for segment in raw.split(',') {
            let bind_name = synthetic_name(name);
            refs.push(format!(":{bind_name}"));
            binds.insert(bind_name, param.data_type.coerce(name, segment)?);
        }
        sql = replace_token(&sql, name, &refs.join(","));
    }
    tracing::trace!(binds = binds.len(), "compiled query");
    Ok(CompiledQuery { sql, binds })
}
