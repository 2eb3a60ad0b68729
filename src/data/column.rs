use std::collections::HashMap;

use crate::pg::{FieldDescription, Oid};

/// One result column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
    pub ordinal: usize,
}

/// Result-set schema, fixed once per query and shared by every row.
#[derive(Debug, Clone, Default)]
pub struct Columns {
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
}

impl Columns {
    pub fn from_fields(fields: &[FieldDescription]) -> Self {
        let columns: Vec<Column> = fields
            .iter()
            .enumerate()
            .map(|(ordinal, f)| Column {
                name: f.name.clone(),
                type_oid: f.type_oid,
                ordinal,
            })
            .collect();

        let mut by_name = HashMap::with_capacity(columns.len());
        for column in &columns {
            // Duplicate names resolve to the leftmost column
            by_name.entry(column.name.clone()).or_insert(column.ordinal);
        }
        Self { columns, by_name }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, ordinal: usize) -> Option<&Column> {
        self.columns.get(ordinal)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Column> {
        self.columns.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

impl<'a> IntoIterator for &'a Columns {
    type Item = &'a Column;
    type IntoIter = std::slice::Iter<'a, Column>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.iter()
    }
}

/// Anything that can pick a column out of a row: an ordinal or a name.
pub trait ColumnIndex {
    fn index(&self, columns: &Columns) -> Option<usize>;

    fn describe(&self) -> String;
}

impl ColumnIndex for usize {
    fn index(&self, columns: &Columns) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }

    fn describe(&self) -> String {
        format!("#{}", self)
    }
}

impl ColumnIndex for &str {
    fn index(&self, columns: &Columns) -> Option<usize> {
        columns.index_of(self)
    }

    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

#[cfg(test)]
pub(crate) fn field(name: &str, oid: Oid) -> FieldDescription {
    use crate::pg::protocol::Format;
    FieldDescription {
        name: name.to_string(),
        table_oid: 0,
        column_attr: 0,
        type_oid: oid,
        type_size: -1,
        type_modifier: -1,
        format: Format::Binary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_ordinal() {
        let columns = Columns::from_fields(&[
            field("id", Oid::INT4),
            field("name", Oid::TEXT),
            field("id", Oid::INT8),
        ]);

        assert_eq!(columns.len(), 3);
        assert_eq!(columns.index_of("name"), Some(1));
        assert_eq!(columns.index_of("id"), Some(0));
        assert_eq!(columns.index_of("missing"), None);
        assert_eq!(columns.get(2).map(|c| c.type_oid), Some(Oid::INT8));
        assert_eq!(columns.names(), vec!["id", "name", "id"]);

        assert_eq!(2usize.index(&columns), Some(2));
        assert_eq!(3usize.index(&columns), None);
        assert_eq!("name".index(&columns), Some(1));
    }
}
