use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};
use smallvec::SmallVec;

use super::column::{ColumnIndex, Columns};
use super::value::{to_json, DataValue, FromValue};
use crate::error::{Error, Result};

/// Values of one row. Most result rows fit inline.
pub(crate) type RowValues = SmallVec<[DataValue; 16]>;

/// One row of a result, sharing its column schema with its siblings.
#[derive(Debug, Clone)]
pub struct DataRow {
    columns: Arc<Columns>,
    values: RowValues,
}

impl DataRow {
    pub(crate) fn new(columns: Arc<Columns>, values: impl IntoIterator<Item = DataValue>) -> Self {
        Self {
            columns,
            values: values.into_iter().collect(),
        }
    }

    /// Typed value of a column, addressed by ordinal or name.
    pub fn get<I: ColumnIndex, T: FromValue>(&self, index: I) -> Result<T> {
        let value = self
            .value(&index)
            .ok_or_else(|| Error::Type(format!("no column {}", index.describe())))?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(msg) => Error::Type(format!("column {}: {}", index.describe(), msg)),
            other => other,
        })
    }

    pub fn value<I: ColumnIndex>(&self, index: &I) -> Option<&DataValue> {
        index.index(&self.columns).and_then(|i| self.values.get(i))
    }

    pub fn values(&self) -> &[DataValue] {
        &self.values
    }

    pub fn columns(&self) -> &Arc<Columns> {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataValue)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }

    /// Row as a JSON object keyed by column name.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .iter()
            .map(|(name, value)| (name.to_string(), to_json(value)))
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn into_values(self) -> Vec<DataValue> {
        self.values.into_vec()
    }
}

impl PartialEq for DataRow {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.columns.names() == other.columns.names()
    }
}

impl Serialize for DataRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &to_json(value))?;
        }
        map.end()
    }
}
