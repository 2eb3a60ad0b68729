//! Typed, immutable query results.

mod column;
mod row;
mod table;
mod value;

#[cfg(test)]
pub(crate) use column::field;
pub use column::{Column, ColumnIndex, Columns};
pub use row::DataRow;
pub use table::{parse_rows_affected, DataTable};
pub use value::{to_json, DataValue, FromValue};
