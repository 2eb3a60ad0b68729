use std::sync::Arc;

use serde::ser::{Serialize, SerializeSeq, Serializer};

use super::column::{ColumnIndex, Columns};
use super::row::DataRow;
use super::value::FromValue;
use crate::backend::QueryResult;
use crate::error::{Error, Result};

/// Immutable, fully materialized result of one statement.
#[derive(Debug, Clone)]
pub struct DataTable {
    columns: Arc<Columns>,
    rows: Vec<DataRow>,
    command_tag: String,
}

impl DataTable {
    pub fn new(columns: Arc<Columns>, rows: Vec<DataRow>, command_tag: impl Into<String>) -> Self {
        Self {
            columns,
            rows,
            command_tag: command_tag.into(),
        }
    }

    pub fn columns(&self) -> &Arc<Columns> {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.names()
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<DataRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataRow> {
        self.rows.iter()
    }

    pub fn first(&self) -> Option<&DataRow> {
        self.rows.first()
    }

    /// Exactly one row, or an error naming how many there were.
    pub fn one(&self) -> Result<&DataRow> {
        match self.rows.as_slice() {
            [row] => Ok(row),
            rows => Err(Error::Type(format!(
                "expected exactly one row, got {}",
                rows.len()
            ))),
        }
    }

    pub fn one_or_none(&self) -> Result<Option<&DataRow>> {
        match self.rows.as_slice() {
            [] => Ok(None),
            [row] => Ok(Some(row)),
            rows => Err(Error::Type(format!(
                "expected at most one row, got {}",
                rows.len()
            ))),
        }
    }

    /// First column of the first row; `None` when there are no rows.
    pub fn scalar<T: FromValue>(&self) -> Result<Option<T>> {
        self.rows.first().map(|row| row.get(0)).transpose()
    }

    /// Every value of one column, in row order.
    pub fn column<I: ColumnIndex, T: FromValue>(&self, index: I) -> Result<Vec<T>> {
        let Some(ordinal) = index.index(&self.columns) else {
            return Err(Error::Type(format!("no column {}", index.describe())));
        };
        self.rows.iter().map(|row| row.get(ordinal)).collect()
    }

    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Rows reported by the command tag; for SELECT this equals `len()`.
    pub fn affected_rows(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.rows.iter().map(DataRow::to_json).collect())
    }
}

impl From<QueryResult> for DataTable {
    fn from(result: QueryResult) -> Self {
        let columns = Arc::new(Columns::from_fields(&result.columns));
        let rows = result
            .rows
            .into_iter()
            .map(|values| DataRow::new(Arc::clone(&columns), values))
            .collect();
        Self::new(columns, rows, result.command_tag)
    }
}

impl<'a> IntoIterator for &'a DataTable {
    type Item = &'a DataRow;
    type IntoIter = std::slice::Iter<'a, DataRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl IntoIterator for DataTable {
    type Item = DataRow;
    type IntoIter = std::vec::IntoIter<DataRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl Serialize for DataTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in &self.rows {
            seq.serialize_element(row)?;
        }
        seq.end()
    }
}

/// Row count from a command tag like `INSERT 0 5`, `UPDATE 3` or `SELECT 10`.
pub fn parse_rows_affected(tag: &str) -> u64 {
    let mut parts = tag.split_whitespace();
    match parts.next() {
        Some("INSERT") => parts.nth(1),
        Some("UPDATE" | "DELETE" | "SELECT" | "MERGE" | "FETCH" | "MOVE" | "COPY") => parts.next(),
        _ => None,
    }
    .and_then(|n| n.parse().ok())
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::column::field;
    use crate::pg::{Oid, PgValue};

    fn table(n: i32) -> DataTable {
        let result = QueryResult {
            columns: Arc::new(vec![field("n", Oid::INT4), field("label", Oid::TEXT)]),
            rows: (1..=n)
                .map(|i| vec![PgValue::Int4(i), PgValue::Text(format!("row{}", i))])
                .collect(),
            command_tag: format!("SELECT {}", n),
        };
        DataTable::from(result)
    }

    #[test]
    fn test_rows_keep_order_and_share_columns() {
        let t = table(3);
        assert_eq!(t.len(), 3);
        assert_eq!(t.column::<_, i32>("n").unwrap(), vec![1, 2, 3]);
        assert!(Arc::ptr_eq(t.rows()[0].columns(), t.rows()[2].columns()));
        assert_eq!(t.column_names(), vec!["n", "label"]);
        assert_eq!(t.affected_rows(), 3);
    }

    #[test]
    fn test_single_row_helpers() {
        assert_eq!(table(0).scalar::<i32>().unwrap(), None);
        assert_eq!(table(2).scalar::<i32>().unwrap(), Some(1));
        assert!(table(0).one().is_err());
        assert!(table(2).one().is_err());
        assert_eq!(table(1).one().unwrap().get::<_, String>(1).unwrap(), "row1");
        assert!(table(0).one_or_none().unwrap().is_none());
        assert!(table(2).one_or_none().is_err());
        assert!(table(1).column::<_, i32>("missing").is_err());
    }

    #[test]
    fn test_parse_rows_affected() {
        assert_eq!(parse_rows_affected("INSERT 0 5"), 5);
        assert_eq!(parse_rows_affected("UPDATE 3"), 3);
        assert_eq!(parse_rows_affected("DELETE 0"), 0);
        assert_eq!(parse_rows_affected("SELECT 10"), 10);
        assert_eq!(parse_rows_affected("CREATE TABLE"), 0);
        assert_eq!(parse_rows_affected(""), 0);
    }

    #[test]
    fn test_serialize() {
        let json = serde_json::to_value(table(2)).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"n": 1, "label": "row1"},
                {"n": 2, "label": "row2"},
            ])
        );
        assert_eq!(table(1).to_json(), serde_json::json!([{"n": 1, "label": "row1"}]));
    }
}
