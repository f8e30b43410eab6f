//! The relational layer: typed rows over the key-value core.
//!
//! A table maps each row to one LSM entry: the encoded primary key is the
//! LSM key, the bincode-serialized row is the value. Schema validation
//! (unknown columns, null constraints, key uniqueness) happens here,
//! before the store is touched; the B+ tree index is rebuilt from a full
//! LSM scan at open.

pub mod database;
pub mod table;
pub mod value;

pub use database::Database;
pub use table::{Column, Row, Table};
pub use value::{DataType, Value};
