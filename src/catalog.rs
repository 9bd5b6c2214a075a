//! System catalog.
//!
//! Table and index metadata persisted as a single bincode file in the
//! data directory. The file is rewritten atomically (temp file + rename)
//! so a crash mid-save leaves the previous version intact. DDL mutates
//! the in-memory catalog immediately; the engine persists it when the
//! enclosing transaction commits and restores the prior state on abort.

use crate::storage::page::FileId;
use crate::storage::{StorageError, StorageResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Text,
    Boolean,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: u32,
    pub heap_file: FileId,
    pub primary_index_file: FileId,
    pub columns: Vec<ColumnMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub file: FileId,
    pub table: String,
    pub column: String,
    pub unique: bool,
}

/// The serialized catalog state. Cloned wholesale for DDL undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogData {
    next_file_id: u32,
    tables: BTreeMap<String, TableMeta>,
    indexes: BTreeMap<String, IndexMeta>,
}

impl Default for CatalogData {
    fn default() -> Self {
        Self {
            next_file_id: 1,
            tables: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }
}

pub struct SystemCatalog {
    path: PathBuf,
    data: RwLock<CatalogData>,
}

impl SystemCatalog {
    pub fn create(path: &Path) -> StorageResult<Self> {
        let catalog = Self {
            path: path.to_path_buf(),
            data: RwLock::new(CatalogData::default()),
        };
        catalog.save()?;
        Ok(catalog)
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let bytes = fs::read(path)?;
        let data: CatalogData = bincode::deserialize(&bytes)
            .map_err(|e| StorageError::Corruption(format!("malformed catalog file: {}", e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
        })
    }

    /// Persist the catalog. Written to a temp file first and renamed
    /// over the old one, so the catalog on disk is always one complete
    /// version or the other.
    pub fn save(&self) -> StorageResult<()> {
        let bytes = self.serialize()?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Serialized form of the current state, for the image a
    /// schema-changing commit writes to the WAL.
    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        bincode::serialize(&*data).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Replace the in-memory state with an image recovered from the WAL.
    pub fn import_bytes(&self, bytes: &[u8]) -> StorageResult<()> {
        let data: CatalogData = bincode::deserialize(bytes)
            .map_err(|e| StorageError::Corruption(format!("malformed catalog image: {}", e)))?;
        *self.data.write() = data;
        Ok(())
    }

    /// Copy of the current state, taken before a DDL statement so abort
    /// can roll the catalog back.
    pub fn export(&self) -> CatalogData {
        self.data.read().clone()
    }

    pub fn import(&self, data: CatalogData) {
        *self.data.write() = data;
    }

    pub fn allocate_file_id(&self) -> FileId {
        let mut data = self.data.write();
        let id = data.next_file_id;
        data.next_file_id += 1;
        FileId(id)
    }

    pub fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnMeta>,
    ) -> StorageResult<TableMeta> {
        let mut data = self.data.write();
        if data.tables.contains_key(name) {
            return Err(StorageError::DuplicateTable(name.to_string()));
        }
        let id = data.next_file_id;
        let heap_file = FileId(data.next_file_id);
        let primary_index_file = FileId(data.next_file_id + 1);
        data.next_file_id += 2;

        let meta = TableMeta {
            id,
            heap_file,
            primary_index_file,
            columns,
        };
        data.tables.insert(name.to_string(), meta.clone());
        Ok(meta)
    }

    /// Remove a table and every index on it, returning what was removed
    /// so the engine can retire the backing files.
    pub fn drop_table(&self, name: &str) -> StorageResult<(TableMeta, Vec<(String, IndexMeta)>)> {
        let mut data = self.data.write();
        let meta = data
            .tables
            .remove(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))?;
        let dropped_indexes: Vec<(String, IndexMeta)> = data
            .indexes
            .iter()
            .filter(|(_, idx)| idx.table == name)
            .map(|(n, idx)| (n.clone(), idx.clone()))
            .collect();
        for (index_name, _) in &dropped_indexes {
            data.indexes.remove(index_name);
        }
        Ok((meta, dropped_indexes))
    }

    pub fn create_index(
        &self,
        name: &str,
        table: &str,
        column: &str,
        unique: bool,
    ) -> StorageResult<IndexMeta> {
        let mut data = self.data.write();
        if data.indexes.contains_key(name) {
            return Err(StorageError::DuplicateIndex(name.to_string()));
        }
        if !data.tables.contains_key(table) {
            return Err(StorageError::TableNotFound(table.to_string()));
        }
        let file = FileId(data.next_file_id);
        data.next_file_id += 1;
        let meta = IndexMeta {
            file,
            table: table.to_string(),
            column: column.to_string(),
            unique,
        };
        data.indexes.insert(name.to_string(), meta.clone());
        Ok(meta)
    }

    /// Reinstate a dropped table verbatim. DDL rollback only; file ids
    /// come from the saved metadata, not the allocator.
    pub fn restore_table(
        &self,
        name: &str,
        meta: TableMeta,
        indexes: Vec<(String, IndexMeta)>,
    ) {
        let mut data = self.data.write();
        data.tables.insert(name.to_string(), meta);
        for (index_name, index_meta) in indexes {
            data.indexes.insert(index_name, index_meta);
        }
    }

    pub fn restore_index(&self, name: &str, meta: IndexMeta) {
        self.data.write().indexes.insert(name.to_string(), meta);
    }

    pub fn drop_index(&self, name: &str) -> StorageResult<IndexMeta> {
        let mut data = self.data.write();
        data.indexes
            .remove(name)
            .ok_or_else(|| StorageError::IndexNotFound(name.to_string()))
    }

    pub fn table(&self, name: &str) -> StorageResult<TableMeta> {
        self.data
            .read()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    pub fn index(&self, name: &str) -> StorageResult<IndexMeta> {
        self.data
            .read()
            .indexes
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::IndexNotFound(name.to_string()))
    }

    pub fn tables(&self) -> Vec<(String, TableMeta)> {
        self.data
            .read()
            .tables
            .iter()
            .map(|(n, m)| (n.clone(), m.clone()))
            .collect()
    }

    pub fn indexes_on(&self, table: &str) -> Vec<(String, IndexMeta)> {
        self.data
            .read()
            .indexes
            .iter()
            .filter(|(_, m)| m.table == table)
            .map(|(n, m)| (n.clone(), m.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn columns() -> Vec<ColumnMeta> {
        vec![
            ColumnMeta {
                name: "id".into(),
                column_type: ColumnType::Integer,
            },
            ColumnMeta {
                name: "body".into(),
                column_type: ColumnType::Text,
            },
        ]
    }

    #[test]
    fn test_create_table_and_persist() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        let meta = {
            let catalog = SystemCatalog::create(&path)?;
            let meta = catalog.create_table("users", columns())?;
            catalog.save()?;
            meta
        };

        let catalog = SystemCatalog::open(&path)?;
        assert_eq!(catalog.table("users")?, meta);
        assert_eq!(catalog.tables().len(), 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_table_rejected() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let catalog = SystemCatalog::create(&dir.path().join("catalog.db"))?;

        catalog.create_table("t", columns())?;
        assert!(matches!(
            catalog.create_table("t", columns()),
            Err(StorageError::DuplicateTable(_))
        ));
        Ok(())
    }

    #[test]
    fn test_file_ids_never_reused() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let catalog = SystemCatalog::create(&dir.path().join("catalog.db"))?;

        let t1 = catalog.create_table("a", columns())?;
        catalog.drop_table("a")?;
        let t2 = catalog.create_table("b", columns())?;
        assert_ne!(t1.heap_file, t2.heap_file);
        Ok(())
    }

    #[test]
    fn test_drop_table_removes_its_indexes() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let catalog = SystemCatalog::create(&dir.path().join("catalog.db"))?;

        catalog.create_table("t", columns())?;
        catalog.create_index("t_body", "t", "body", false)?;
        let (_, dropped) = catalog.drop_table("t")?;
        assert_eq!(dropped.len(), 1);
        assert!(matches!(
            catalog.index("t_body"),
            Err(StorageError::IndexNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_export_import_rolls_back() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let catalog = SystemCatalog::create(&dir.path().join("catalog.db"))?;
        catalog.create_table("keep", columns())?;

        let snapshot = catalog.export();
        catalog.create_table("discard", columns())?;
        catalog.import(snapshot);

        assert!(catalog.table("keep").is_ok());
        assert!(matches!(
            catalog.table("discard"),
            Err(StorageError::TableNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_index_requires_table() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let catalog = SystemCatalog::create(&dir.path().join("catalog.db"))?;
        assert!(matches!(
            catalog.create_index("i", "missing", "c", true),
            Err(StorageError::TableNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_crash_during_save_keeps_old_version() -> StorageResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        {
            let catalog = SystemCatalog::create(&path)?;
            catalog.create_table("t", columns())?;
            catalog.save()?;
        }
        // A leftover temp file from an interrupted save must not matter
        std::fs::write(path.with_extension("tmp"), b"garbage").unwrap();

        let catalog = SystemCatalog::open(&path)?;
        assert!(catalog.table("t").is_ok());
        Ok(())
    }
}
