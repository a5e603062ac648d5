//! Collection queries and filter evaluation
//!
//! The store contract supports equality, inequality, `in` and
//! `array-contains-any` filters, ordering by one field, a limit, and a
//! `start_after` cursor naming the last document already seen.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::document::{get_dotted, Document, Value};

/// Filter operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    ArrayContainsAny,
}

/// A single `field op value` condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Evaluate this filter against a document
    pub fn matches(&self, doc: &Document) -> bool {
        let field = get_dotted(&doc.fields, &self.field);
        match self.op {
            FilterOp::Eq => field == Some(&self.value),
            FilterOp::Ne => field.is_some() && field != Some(&self.value),
            FilterOp::Lt => compare_present(field, &self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                compare_present(field, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_present(field, &self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                compare_present(field, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => match (field, self.value.as_array()) {
                (Some(v), Some(options)) => options.contains(v),
                _ => false,
            },
            FilterOp::ArrayContainsAny => match (field.and_then(Value::as_array), self.value.as_array()) {
                (Some(items), Some(options)) => items.iter().any(|i| options.contains(i)),
                _ => false,
            },
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// A query over the direct children of one collection path
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, OrderDirection)>,
    pub limit: Option<usize>,
    pub start_after: Option<Cursor>,
}

/// The last document of the previous page
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cursor {
    pub id: String,
    /// Its value of the order field. With it the cursor is a position in the
    /// ordering and survives the document's removal.
    pub order_value: Option<Value>,
}

impl Query {
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection: path.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resume after the document with ID `id`
    pub fn start_after(mut self, id: impl Into<String>) -> Self {
        self.start_after = Some(Cursor {
            id: id.into(),
            order_value: None,
        });
        self
    }

    /// Resume after the position `(order_value, id)` in the ordering
    pub fn start_after_key(mut self, order_value: impl Into<Value>, id: impl Into<String>) -> Self {
        self.start_after = Some(Cursor {
            id: id.into(),
            order_value: Some(order_value.into()),
        });
        self
    }

    fn compare_keys(&self, a: (Option<&Value>, &str), b: (Option<&Value>, &str)) -> Ordering {
        let by_field = match self.order_by {
            Some((_, direction)) => {
                let cmp = compare_values(a.0, b.0);
                match direction {
                    OrderDirection::Asc => cmp,
                    OrderDirection::Desc => cmp.reverse(),
                }
            }
            None => Ordering::Equal,
        };
        by_field.then_with(|| a.1.cmp(b.1))
    }

    fn order_value<'d>(&self, doc: &'d Document) -> Option<&'d Value> {
        self.order_by.as_ref().and_then(|(field, _)| get_dotted(&doc.fields, field))
    }

    /// Apply filters, ordering, cursor and limit to a candidate set.
    /// Candidates must already be the collection's direct children.
    pub fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        docs.retain(|doc| self.filters.iter().all(|f| f.matches(doc)));

        docs.sort_by(|a, b| {
            self.compare_keys((self.order_value(a), a.id.as_str()), (self.order_value(b), b.id.as_str()))
        });

        if let Some(ref cursor) = self.start_after {
            match cursor.order_value {
                Some(ref value) => {
                    let after = (Some(value), cursor.id.as_str());
                    docs.retain(|d| self.compare_keys((self.order_value(d), d.id.as_str()), after) == Ordering::Greater);
                }
                None => match docs.iter().position(|d| d.id == cursor.id) {
                    Some(pos) => {
                        docs.drain(..=pos);
                    }
                    None => tracing::debug!("Cursor '{}' not found in {}", cursor.id, self.collection),
                },
            }
        }

        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }

        docs
    }
}

fn compare_present(field: Option<&Value>, value: &Value) -> Option<Ordering> {
    let field = field?;
    match (field, value) {
        (Value::Int(_), Value::Int(_))
        | (Value::Float(_), Value::Float(_))
        | (Value::Int(_), Value::Float(_))
        | (Value::Float(_), Value::Int(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_)) => Some(compare_values(Some(field), Some(value))),
        _ => None,
    }
}

/// Total order used for sorting; missing values sort first
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Int(a)), Some(Value::Int(b))) => a.cmp(b),
        (Some(Value::Float(a)), Some(Value::Float(b))) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Some(Value::Int(a)), Some(Value::Float(b))) => {
            (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Float(a)), Some(Value::Int(b))) => {
            a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => Ordering::Equal,
    }
}
