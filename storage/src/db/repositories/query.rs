// Filter, ordering and pagination types for repository list operations

use crate::db::backend::FieldMap;
use serde_json::Value;
use std::cmp::Ordering;

/// Default result cap when the caller does not pick one; no operation ever
/// performs an unbounded scan
pub const DEFAULT_LIMIT: u64 = 100;

/// Comparison operator for one predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One field predicate
#[derive(Debug, Clone)]
pub struct Predicate {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Conjunction of field-equality/range predicates
///
/// An empty filter matches every row.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOp::Eq, value)
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOp::Lt, value)
    }

    pub fn le(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOp::Le, value)
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOp::Gt, value)
    }

    pub fn ge(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterOp::Ge, value)
    }

    fn push(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Whether a row satisfies every predicate
    pub fn matches(&self, row: &FieldMap) -> bool {
        self.predicates.iter().all(|p| {
            let actual = row.get(&p.field).unwrap_or(&Value::Null);
            match compare_values(actual, &p.value) {
                Some(ord) => match p.op {
                    FilterOp::Eq => ord == Ordering::Equal,
                    FilterOp::Lt => ord == Ordering::Less,
                    FilterOp::Le => ord != Ordering::Greater,
                    FilterOp::Gt => ord == Ordering::Greater,
                    FilterOp::Ge => ord != Ordering::Less,
                },
                // Incomparable values (type mismatch, nulls) match nothing
                None => false,
            }
        })
    }
}

/// Result ordering; defaults to primary key ascending
#[derive(Debug, Clone, Default)]
pub struct Sort {
    pub field: Option<String>,
    pub descending: bool,
}

impl Sort {
    /// Primary key ascending
    pub fn primary_key() -> Self {
        Self::default()
    }

    pub fn by(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            descending: false,
        }
    }

    pub fn by_desc(field: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            descending: true,
        }
    }
}

/// Zero-based offset plus a mandatory result cap
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Total order over the JSON scalars rows are made of
///
/// Numbers compare numerically, strings lexicographically, booleans
/// false < true. Mixed types and nulls are incomparable.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(xi), Some(yi)) = (x.as_i64(), y.as_i64()) {
                Some(xi.cmp(&yi))
            } else {
                x.as_f64().and_then(|xf| y.as_f64().and_then(|yf| xf.partial_cmp(&yf)))
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::new();
        assert!(filter.matches(&row(&[("id", json!(1))])));
        assert!(filter.matches(&FieldMap::new()));
    }

    #[test]
    fn test_conjunction_of_predicates() {
        let filter = Filter::new().eq("status", "active").ge("age", 18);
        assert!(filter.matches(&row(&[("status", json!("active")), ("age", json!(21))])));
        assert!(!filter.matches(&row(&[("status", json!("active")), ("age", json!(17))])));
        assert!(!filter.matches(&row(&[("status", json!("banned")), ("age", json!(30))])));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let filter = Filter::new().eq("email", "a@b.c");
        assert!(!filter.matches(&row(&[("id", json!(7))])));
    }

    #[test]
    fn test_range_over_strings() {
        let filter = Filter::new().lt("name", "m");
        assert!(filter.matches(&row(&[("name", json!("alice"))])));
        assert!(!filter.matches(&row(&[("name", json!("zoe"))])));
    }

    #[test]
    fn test_mixed_types_are_incomparable() {
        let filter = Filter::new().eq("age", 30);
        assert!(!filter.matches(&row(&[("age", json!("30"))])));
    }

    #[test]
    fn test_page_default_is_bounded() {
        let page = Page::default();
        assert_eq!(page.offset, 0);
        assert_eq!(page.limit, DEFAULT_LIMIT);
    }
}
