//! Filters, sorting and index descriptions.
//!
//! Conjunctions of per-field conditions, multi-key sort, skip and limit.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::Document;

/// Condition on a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
    /// Field is missing or `null`.
    IsNull,
    Gte(Value),
    Lte(Value),
}

impl Condition {
    pub fn matches(&self, field: Option<&Value>) -> bool {
        let present = field.filter(|v| !v.is_null());
        match self {
            Condition::IsNull => present.is_none(),
            Condition::Eq(expected) => present.is_some_and(|v| values_equal(v, expected)),
            Condition::In(options) => present.is_some_and(|v| options.iter().any(|o| values_equal(v, o))),
            Condition::Gte(bound) => present.is_some_and(|v| same_kind(v, bound) && compare_values(v, bound) != Ordering::Less),
            Condition::Lte(bound) => present.is_some_and(|v| same_kind(v, bound) && compare_values(v, bound) != Ordering::Greater),
        }
    }
}

/// Conjunction of field conditions. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn is_in(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(field, Condition::In(values))
    }

    pub fn is_null(self, field: impl Into<String>) -> Self {
        self.with(field, Condition::IsNull)
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gte(value.into()))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lte(value.into()))
    }

    pub fn with(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.push((field.into(), condition));
        self
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| condition.matches(document.get(field)))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A `find` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindQuery {
    pub filter: Filter,
    pub sort: Vec<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Order two documents by the sort keys; equal keys compare equal.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, order) in &self.sort {
            let ord = compare_values(
                a.get(field).unwrap_or(&Value::Null),
                b.get(field).unwrap_or(&Value::Null),
            );
            let ord = match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Non-unique index over one or more fields of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub collection: String,
    pub fields: Vec<(String, SortOrder)>,
}

impl IndexSpec {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            fields: Vec::new(),
        }
    }

    pub fn on(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.fields.push((field.into(), order));
        self
    }

    /// Stable name derived from collection and fields.
    pub fn name(&self) -> String {
        let mut name = self.collection.clone();
        for (field, order) in &self.fields {
            let dir = match order {
                SortOrder::Ascending => "asc",
                SortOrder::Descending => "desc",
            };
            name.push('_');
            name.push_str(field);
            name.push('_');
            name.push_str(dir);
        }
        name.to_ascii_lowercase()
    }
}

/// Result of `replace_one`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Number of documents the filter matched (0 or 1).
    pub matched: u64,
    /// Whether a new document was inserted because nothing matched.
    pub upserted: bool,
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::String(_) => 1,
        Value::Number(_) => 2,
        Value::Bool(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    kind_rank(a) == kind_rank(b)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    same_kind(a, b) && compare_values(a, b) == Ordering::Equal
}

/// Total order over JSON values used for sorting and range conditions.
///
/// Values of different kinds order as null < string < number < bool < array <
/// object; numbers compare numerically, strings byte-wise.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}
