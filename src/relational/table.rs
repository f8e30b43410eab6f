//! Tables: typed rows over the key-value store.
//!
//! A table owns one [`Store`] and a B+ tree index keyed by the encoded
//! primary key. Rows are validated against the schema before touching the
//! store; on open the index is repopulated by replaying a full LSM scan.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::bptree::BPlusTree;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::Store;

use super::value::{DataType, Value};

/// B+ tree fan-out for the primary-key index.
const INDEX_ORDER: usize = 4;

/// A row is a mapping from column name to value. Columns absent from the
/// map read as NULL.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub datatype: DataType,
    pub primary_key: bool,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            datatype,
            primary_key: false,
            nullable: true,
        }
    }

    /// Mark as the primary key. Implies not-null.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

pub struct Table {
    name: String,
    columns: Vec<Column>,
    primary_key: usize,
    store: Store,
    index: RwLock<BPlusTree<Vec<u8>, Row>>,
}

impl Table {
    /// Open (or create) a table. Repopulates the B+ tree index from the
    /// store's current contents.
    pub fn open(
        name: impl Into<String>,
        columns: Vec<Column>,
        config: StoreConfig,
    ) -> Result<Self> {
        let name = name.into();
        let mut primary_keys = columns.iter().enumerate().filter(|(_, c)| c.primary_key);
        let primary_key = match (primary_keys.next(), primary_keys.next()) {
            (Some((idx, _)), None) => idx,
            (None, _) => {
                return Err(Error::InvalidInput(format!(
                    "table {} has no primary key column",
                    name
                )))
            }
            (Some(_), Some(_)) => {
                return Err(Error::InvalidInput(format!(
                    "table {} has multiple primary key columns",
                    name
                )))
            }
        };

        let table = Self {
            name,
            columns,
            primary_key,
            store: Store::open_with_config(config)?,
            index: RwLock::new(BPlusTree::new(INDEX_ORDER)),
        };
        table.reload_index()?;
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Insert a new row. Fails on schema violations and duplicate keys.
    pub fn insert(&self, row: Row) -> Result<()> {
        self.validate_row(&row)?;
        let key = self.primary_key_bytes(&row)?;

        if self.index.read()?.search(&key).is_some() {
            return Err(Error::InvalidInput(format!(
                "duplicate primary key {} in table {}",
                row[&self.columns[self.primary_key].name], self.name
            )));
        }

        self.store.put(&key, &bincode::serialize(&row)?)?;
        self.index.write()?.insert(key, row);
        Ok(())
    }

    /// Fetch a row by primary key via the B+ tree index.
    pub fn get(&self, primary_key: &Value) -> Result<Option<Row>> {
        let key = primary_key.encode_key()?;
        Ok(self.index.read()?.search(&key).cloned())
    }

    /// Merge `changes` into an existing row. The primary key cannot change.
    pub fn update(&self, primary_key: &Value, changes: Row) -> Result<()> {
        let key = primary_key.encode_key()?;
        let mut row = self
            .index
            .read()?
            .search(&key)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "no row with primary key {} in table {}",
                    primary_key, self.name
                ))
            })?;

        let pk_name = &self.columns[self.primary_key].name;
        if let Some(new_pk) = changes.get(pk_name) {
            if Some(new_pk) != row.get(pk_name) {
                return Err(Error::InvalidInput(format!(
                    "cannot change primary key of table {}",
                    self.name
                )));
            }
        }

        row.extend(changes);
        self.validate_row(&row)?;

        self.store.put(&key, &bincode::serialize(&row)?)?;
        self.index.write()?.insert(key, row);
        Ok(())
    }

    /// Delete a row by primary key. Writes an LSM tombstone and rebuilds
    /// the index, which has no point delete.
    pub fn delete(&self, primary_key: &Value) -> Result<()> {
        let key = primary_key.encode_key()?;
        if self.index.read()?.search(&key).is_none() {
            return Err(Error::InvalidInput(format!(
                "no row with primary key {} in table {}",
                primary_key, self.name
            )));
        }

        self.store.delete(&key)?;
        self.reload_index()
    }

    /// Rows in primary-key order. A fully bounded scan walks the B+ tree
    /// leaf chain; open-ended scans stream from the LSM.
    pub fn scan(&self, lo: Option<&Value>, hi: Option<&Value>) -> Result<Vec<Row>> {
        if let (Some(lo), Some(hi)) = (lo, hi) {
            let lo = lo.encode_key()?;
            let hi = hi.encode_key()?;
            return Ok(self
                .index
                .read()?
                .range(&lo, &hi)
                .map(|(_, row)| row.clone())
                .collect());
        }

        let range = (
            match lo {
                Some(lo) => std::ops::Bound::Included(lo.encode_key()?),
                None => std::ops::Bound::Unbounded,
            },
            match hi {
                Some(hi) => std::ops::Bound::Included(hi.encode_key()?),
                None => std::ops::Bound::Unbounded,
            },
        );
        let mut rows = Vec::new();
        for item in self.store.scan(range)? {
            let (_, bytes) = item?;
            rows.push(bincode::deserialize(&bytes)?);
        }
        Ok(rows)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.index.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.index.read()?.is_empty())
    }

    fn reload_index(&self) -> Result<()> {
        let mut index = BPlusTree::new(INDEX_ORDER);
        for item in self.store.scan(..)? {
            let (key, bytes) = item?;
            let row: Row = bincode::deserialize(&bytes)?;
            index.insert(key, row);
        }
        *self.index.write()? = index;
        Ok(())
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        for name in row.keys() {
            if !self.columns.iter().any(|column| &column.name == name) {
                return Err(Error::InvalidInput(format!(
                    "unknown column {} in table {}",
                    name, self.name
                )));
            }
        }

        for column in &self.columns {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if !column.nullable {
                    return Err(Error::InvalidInput(format!(
                        "column {} of table {} cannot be NULL",
                        column.name, self.name
                    )));
                }
            } else if value.datatype() != Some(column.datatype) {
                return Err(Error::InvalidInput(format!(
                    "column {} of table {} expects {}, got {}",
                    column.name, self.name, column.datatype, value
                )));
            }
        }
        Ok(())
    }

    fn primary_key_bytes(&self, row: &Row) -> Result<Vec<u8>> {
        let column = &self.columns[self.primary_key];
        match row.get(&column.name) {
            Some(value) if !value.is_null() => value.encode_key(),
            _ => Err(Error::InvalidInput(format!(
                "missing primary key {} in table {}",
                column.name, self.name
            ))),
        }
    }
}
