//! A named-table registry over a shared directory. Each table gets its own
//! subdirectory and store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::config::StoreConfig;
use crate::error::{Error, Result};

use super::table::{Column, Table};

pub struct Database {
    path: PathBuf,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Database {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            tables: RwLock::new(HashMap::new()),
        })
    }

    pub fn create_table(&self, name: &str, columns: Vec<Column>) -> Result<Arc<Table>> {
        let mut tables = self.tables.write()?;
        if tables.contains_key(name) {
            return Err(Error::InvalidInput(format!(
                "table {} already exists",
                name
            )));
        }

        let table = Arc::new(Table::open(
            name,
            columns,
            StoreConfig::new(self.path.join(name)),
        )?);
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().unwrap().get(name).cloned()
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let removed = self.tables.write()?.remove(name);
        if removed.is_none() {
            return Err(Error::InvalidInput(format!(
                "table {} does not exist",
                name
            )));
        }

        let table_dir = self.path.join(name);
        if table_dir.exists() {
            std::fs::remove_dir_all(&table_dir)?;
        }
        Ok(())
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}
