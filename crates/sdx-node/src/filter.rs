use std::cell::OnceCell;
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::RecordEnvelope;

/// Comparison operators supported by session filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Between,
    Contains,
    StartsWith,
}

/// One `field op value` predicate.
///
/// Envelope fields are addressed by name (`cid`, `schema`, `publisher`,
/// `received_at`, `size`); any other field is resolved as a dot path into
/// the payload, when the payload parses as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// AND-composed filter list; a record failing any filter is not delivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(pub Vec<FieldFilter>);

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, view: &RecordView<'_>) -> bool {
        self.0.iter().all(|filter| {
            view.lookup(&filter.field)
                .map(|value| eval(&value, filter))
                .unwrap_or(false)
        })
    }
}

/// Field-addressable view over one record, parsing the payload as JSON at
/// most once per record.
pub struct RecordView<'a> {
    envelope: &'a RecordEnvelope,
    payload: OnceCell<Option<Value>>,
}

impl<'a> RecordView<'a> {
    pub fn new(envelope: &'a RecordEnvelope) -> Self {
        Self {
            envelope,
            payload: OnceCell::new(),
        }
    }

    fn payload_json(&self) -> Option<&Value> {
        self.payload
            .get_or_init(|| serde_json::from_slice(&self.envelope.bytes).ok())
            .as_ref()
    }

    fn lookup(&self, field: &str) -> Option<Value> {
        match field {
            "cid" => Some(Value::String(self.envelope.cid.clone())),
            "schema" => Some(Value::String(self.envelope.schema.to_string())),
            "publisher" => Some(Value::String(self.envelope.publisher.to_hex())),
            "received_at" => Some(Value::from(self.envelope.received_at)),
            "size" => Some(Value::from(self.envelope.bytes.len() as u64)),
            path => {
                let mut cursor = self.payload_json()?;
                for segment in path.split('.') {
                    cursor = cursor.get(segment)?;
                }
                Some(cursor.clone())
            }
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match compare(a, b) {
        Some(order) => order == Ordering::Equal,
        None => a == b,
    }
}

fn eval(value: &Value, filter: &FieldFilter) -> bool {
    match filter.op {
        FilterOp::Eq => values_equal(value, &filter.value),
        FilterOp::Ne => !values_equal(value, &filter.value),
        FilterOp::Lt => matches!(compare(value, &filter.value), Some(Ordering::Less)),
        FilterOp::Le => matches!(
            compare(value, &filter.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Gt => matches!(compare(value, &filter.value), Some(Ordering::Greater)),
        FilterOp::Ge => matches!(
            compare(value, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::In => match &filter.value {
            Value::Array(candidates) => candidates.iter().any(|c| values_equal(value, c)),
            _ => false,
        },
        FilterOp::Between => match &filter.value {
            Value::Array(bounds) if bounds.len() == 2 => {
                matches!(
                    compare(value, &bounds[0]),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare(value, &bounds[1]),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            _ => false,
        },
        FilterOp::Contains => match (value, &filter.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            _ => false,
        },
        FilterOp::StartsWith => match (value, &filter.value) {
            (Value::String(text), Value::String(prefix)) => text.starts_with(prefix),
            _ => false,
        },
    }
}
