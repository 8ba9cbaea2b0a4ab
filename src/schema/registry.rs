use super::types::TargetType;
use crate::event::TableId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Version column added to every replicated table.
pub const VERSION_COLUMN: &str = "_version";
/// Tombstone flag added to every replicated table.
pub const DELETED_COLUMN: &str = "_is_deleted";

pub fn is_reserved_column(name: &str) -> bool {
    name.eq_ignore_ascii_case(VERSION_COLUMN) || name.eq_ignore_ascii_case(DELETED_COLUMN)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub target_type: TargetType,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, target_type: TargetType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            target_type,
            nullable,
        }
    }
}

/// Target-side definition of one replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableId,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnSchema> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }

    /// Columns that identify a row for merging.
    ///
    /// Tables without a primary key merge on the full row.
    pub fn key_columns(&self) -> Vec<&str> {
        if self.primary_key.is_empty() {
            self.columns.iter().map(|c| c.name.as_str()).collect()
        } else {
            self.primary_key.iter().map(String::as_str).collect()
        }
    }

    /// Stable digest of the definition, for spotting drift between instances.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.table.to_string().as_bytes());
        for column in &self.columns {
            hasher.update(b"|");
            hasher.update(column.name.as_bytes());
            hasher.update(column.target_type.sql().as_bytes());
            hasher.update(if column.nullable { b"N" } else { b"R" });
        }
        hasher.update(b"|pk:");
        hasher.update(self.primary_key.join(",").as_bytes());
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// A whole-entry registry mutation.
#[derive(Debug, Clone)]
pub enum RegistryChange {
    Put(TableSchema),
    Remove(TableId),
}

/// In-memory map of table identity to target schema.
///
/// Entries are immutable `Arc`s that are swapped whole, so a reader holding a
/// snapshot always sees one consistent definition. Only the DDL translator
/// mutates the registry.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: RwLock<HashMap<TableId, Arc<TableSchema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, schemas: Vec<TableSchema>) {
        let mut tables = self.write();
        for schema in schemas {
            tables.insert(schema.table.clone(), Arc::new(schema));
        }
    }

    pub fn get(&self, table: &TableId) -> Option<Arc<TableSchema>> {
        self.read().get(table).cloned()
    }

    pub fn contains(&self, table: &TableId) -> bool {
        self.read().contains_key(table)
    }

    pub fn replace(&self, schema: TableSchema) {
        self.write().insert(schema.table.clone(), Arc::new(schema));
    }

    pub fn remove(&self, table: &TableId) -> Option<Arc<TableSchema>> {
        self.write().remove(table)
    }

    /// Apply a set of changes under one write lock.
    pub fn apply(&self, changes: Vec<RegistryChange>) {
        let mut tables = self.write();
        for change in changes {
            match change {
                RegistryChange::Put(schema) => {
                    tables.insert(schema.table.clone(), Arc::new(schema));
                }
                RegistryChange::Remove(table) => {
                    tables.remove(&table);
                }
            }
        }
    }

    pub fn tables(&self) -> Vec<Arc<TableSchema>> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.table.cmp(&b.table));
        all
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Entries are replaced whole, so a poisoned lock still guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TableId, Arc<TableSchema>>> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TableId, Arc<TableSchema>>> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}
