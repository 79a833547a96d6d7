//! The dynamic column model: JSON values, named-column access, and row identity.
//!
//! Records are opaque to the engine except at two seams. Operators that address
//! columns by *name* (group-by, the aggregations, projection) require their row type
//! to implement [`Record`], which resolves a column name to a [`Value`]. Operators
//! that need record *identity* (change-set merging, join bookkeeping) use a cached
//! structural serialization of the record, computed by [`fingerprint`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::{Comparator, Data};

/// A dynamically-typed column value.
pub type Value = serde_json::Value;

/// A record whose columns can be addressed by name.
///
/// `column` returns [`Value::Null`] for columns the record does not carry; the
/// engine treats null and absent columns identically (both are skipped by the typed
/// aggregations, both compare before every non-null value).
pub trait Record: Data {
    /// The value of the named column, or `Value::Null` when absent.
    fn column(&self, name: &str) -> Value;
}

/// A row of named columns, ordered by column name.
///
/// This is the row type built by projection and emitted by every aggregation. It is
/// also convenient as a base-table row type for callers without a typed schema.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnedRow {
    columns: BTreeMap<String, Value>,
}

impl OwnedRow {
    /// An empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// A row with a single column.
    pub fn single(name: impl Into<String>, value: Value) -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(name.into(), value);
        OwnedRow { columns }
    }

    /// Sets a column, returning the row for chaining.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.columns.insert(name.into(), value);
        self
    }

    /// The value of a column, or `None` when absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    /// The number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterates the columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.columns.iter()
    }
}

impl Record for OwnedRow {
    fn column(&self, name: &str) -> Value {
        self.columns.get(name).cloned().unwrap_or(Value::Null)
    }
}

impl<N: Into<String>> FromIterator<(N, Value)> for OwnedRow {
    fn from_iter<I: IntoIterator<Item = (N, Value)>>(iter: I) -> Self {
        OwnedRow {
            columns: iter.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        }
    }
}

/// A total order over [`Value`]s.
///
/// Values of different types order by type rank (null, booleans, numbers, strings,
/// arrays, objects); values of the same type order naturally. Numbers compare as
/// `f64`; arrays lexicographically; objects as ordered name/value sequences. This is
/// the order used for group keys, join keys, and column-derived sorts.
pub fn value_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match value_cmp(xi, yi) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                match xk.cmp(yk).then_with(|| value_cmp(xv, yv)) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// A comparator ordering records by the value of a named column.
///
/// Rows equal in the column are tie-broken by their serialization, so the order is
/// total and distinguishes distinct rows, making it safe for set-semantic containers.
pub fn by_column<T: Record>(name: impl Into<String>) -> Comparator<T> {
    let name = name.into();
    Rc::new(move |a: &T, b: &T| {
        value_cmp(&a.column(&name), &b.column(&name))
            .then_with(|| fingerprint(a).cmp(&fingerprint(b)))
    })
}

/// A comparator ordering records by their structural serialization.
///
/// Distinguishes any two structurally distinct records; the order itself is
/// arbitrary but deterministic.
pub fn serialized_order<T: Data>() -> Comparator<T> {
    Rc::new(|a: &T, b: &T| fingerprint(a).cmp(&fingerprint(b)))
}

/// The structural serialization of a record, used as its identity.
///
/// # Panics
///
/// Panics if the record fails to serialize; [`Data`](crate::Data) rows are required
/// to be serializable.
pub fn fingerprint<T: Serialize>(record: &T) -> String {
    serde_json::to_string(record).expect("records must serialize")
}

/// A row wrapped with an extracted key, ordered key-first.
///
/// Join sides and column-ordered aggregation state store rows this way: the key is
/// the primary sort (via [`value_cmp`]) and the row's cached serialization breaks
/// ties, which makes range seeks by key O(log n) while still distinguishing every
/// distinct row.
#[derive(Clone, Debug)]
pub(crate) struct Keyed<T> {
    pub key: Value,
    pub row: T,
    fp: String,
}

impl<T: Data> Keyed<T> {
    pub fn new(key: Value, row: T) -> Self {
        let fp = fingerprint(&row);
        Keyed { key, row, fp }
    }
}

/// The composite comparator for [`Keyed`] entries: key first, serialized row second.
pub(crate) fn keyed_cmp<T: Data>() -> Comparator<Keyed<T>> {
    Rc::new(|a: &Keyed<T>, b: &Keyed<T>| {
        value_cmp(&a.key, &b.key).then_with(|| a.fp.cmp(&b.fp))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_order_ranks_types_then_values() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-3),
            json!(2.5),
            json!(10),
            json!("a"),
            json!("b"),
            json!([1, 2]),
            json!([1, 2, 0]),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(value_cmp(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
            assert_eq!(value_cmp(&pair[1], &pair[0]), Ordering::Greater);
        }
        for v in &ordered {
            assert_eq!(value_cmp(v, v), Ordering::Equal);
        }
    }

    #[test]
    fn owned_row_column_access() {
        let row: OwnedRow = [("id", json!(7)), ("name", json!("x"))].into_iter().collect();
        assert_eq!(row.column("id"), json!(7));
        assert_eq!(row.column("missing"), Value::Null);
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn by_column_breaks_ties_by_serialization() {
        let cmp = by_column::<OwnedRow>("v");
        let a: OwnedRow = [("id", json!(1)), ("v", json!(5))].into_iter().collect();
        let b: OwnedRow = [("id", json!(2)), ("v", json!(5))].into_iter().collect();
        assert_ne!(cmp(&a, &b), Ordering::Equal);
        assert_eq!(cmp(&a, &a), Ordering::Equal);
    }
}
