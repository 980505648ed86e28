//! Document criteria.
//!
//! A small criteria tree that the in-memory backend evaluates directly and the
//! SQL backend translates into a parameterized WHERE clause over a JSON column:
//!
//! ```sql
//! -- MySQL
//! JSON_UNQUOTE(JSON_EXTRACT(body, '$.field')) = ?          -- text
//! JSON_EXTRACT(body, '$.field') = ?                        -- number
//! LOWER(JSON_UNQUOTE(JSON_EXTRACT(body, '$.field'))) = LOWER(?)
//! -- SQLite
//! json_extract(body, '$.field') = ?
//! LOWER(CAST(json_extract(body, '$.field') AS TEXT)) = LOWER(?)
//! ```

use serde_json::Value;

use super::traits::StorageError;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Numeric(f64),
    Boolean(bool),
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::Text(s)
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        FilterValue::Numeric(n as f64)
    }
}

impl From<f64> for FilterValue {
    fn from(n: f64) -> Self {
        FilterValue::Numeric(n)
    }
}

impl From<bool> for FilterValue {
    fn from(b: bool) -> Self {
        FilterValue::Boolean(b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, FilterValue),
    /// Case-insensitive comparison of the field's string form.
    EqIgnoreCase(String, String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn eq_ignore_case(field: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::EqIgnoreCase(field.into(), value.into())
    }

    /// Conjunction that flattens `All` away.
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    /// Evaluate against a decoded document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, expected) => match (lookup(doc, field), expected) {
                (Some(Value::String(s)), FilterValue::Text(t)) => s == t,
                (Some(Value::Number(n)), FilterValue::Numeric(x)) => n.as_f64() == Some(*x),
                (Some(Value::Bool(b)), FilterValue::Boolean(x)) => b == x,
                _ => false,
            },
            Filter::EqIgnoreCase(field, expected) => lookup(doc, field)
                .and_then(scalar_string)
                .map(|s| s.eq_ignore_ascii_case(expected))
                .unwrap_or(false),
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
        }
    }

    /// Translate to a parameterized clause for the given dialect.
    pub fn to_sql(&self, json_col: &str, dialect: SqlDialect) -> Result<SqlClause, StorageError> {
        let mut params = Vec::new();
        let clause = translate(self, json_col, dialect, &mut params)?;
        Ok(SqlClause { clause, params })
    }
}

/// Dotted path lookup ("stats.kills").
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| cur.get(seg))
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Mysql,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Numeric(f64),
    Integer(i64),
}

#[derive(Debug, Clone)]
pub struct SqlClause {
    pub clause: String,
    pub params: Vec<SqlParam>,
}

fn json_path(field: &str) -> Result<String, StorageError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        return Err(StorageError::InvalidFilter(format!("bad field name '{}'", field)));
    }
    Ok(format!("$.{}", field))
}

fn translate(
    filter: &Filter,
    json_col: &str,
    dialect: SqlDialect,
    params: &mut Vec<SqlParam>,
) -> Result<String, StorageError> {
    match filter {
        Filter::All => Ok("1 = 1".to_string()),
        Filter::Eq(field, value) => {
            let path = json_path(field)?;
            Ok(match (dialect, value) {
                (SqlDialect::Mysql, FilterValue::Text(t)) => {
                    params.push(SqlParam::Text(t.clone()));
                    format!("JSON_UNQUOTE(JSON_EXTRACT({}, '{}')) = ?", json_col, path)
                }
                (SqlDialect::Sqlite, FilterValue::Text(t)) => {
                    params.push(SqlParam::Text(t.clone()));
                    format!("json_extract({}, '{}') = ?", json_col, path)
                }
                (SqlDialect::Mysql, FilterValue::Numeric(n)) => {
                    params.push(SqlParam::Numeric(*n));
                    format!("JSON_EXTRACT({}, '{}') = ?", json_col, path)
                }
                (SqlDialect::Sqlite, FilterValue::Numeric(n)) => {
                    params.push(SqlParam::Numeric(*n));
                    format!("json_extract({}, '{}') = ?", json_col, path)
                }
                (SqlDialect::Mysql, FilterValue::Boolean(b)) => {
                    params.push(SqlParam::Text(b.to_string()));
                    format!("JSON_EXTRACT({}, '{}') = CAST(? AS JSON)", json_col, path)
                }
                // SQLite's json_extract yields 1/0 for JSON booleans
                (SqlDialect::Sqlite, FilterValue::Boolean(b)) => {
                    params.push(SqlParam::Integer(i64::from(*b)));
                    format!("json_extract({}, '{}') = ?", json_col, path)
                }
            })
        }
        Filter::EqIgnoreCase(field, value) => {
            let path = json_path(field)?;
            params.push(SqlParam::Text(value.clone()));
            Ok(match dialect {
                SqlDialect::Mysql => format!(
                    "LOWER(JSON_UNQUOTE(JSON_EXTRACT({}, '{}'))) = LOWER(?)",
                    json_col, path
                ),
                SqlDialect::Sqlite => format!(
                    "LOWER(CAST(json_extract({}, '{}') AS TEXT)) = LOWER(?)",
                    json_col, path
                ),
            })
        }
        Filter::And(parts) => {
            if parts.is_empty() {
                return Ok("1 = 1".to_string());
            }
            let clauses = parts
                .iter()
                .map(|p| translate(p, json_col, dialect, params))
                .collect::<Result<Vec<_>, _>>()?;
            if clauses.len() == 1 {
                Ok(clauses.into_iter().next().unwrap_or_default())
            } else {
                Ok(format!("({})", clauses.join(" AND ")))
            }
        }
    }
}
