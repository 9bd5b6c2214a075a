//! Engine context object.
//!
//! Owns the buffer pool, WAL, catalog, transaction manager and vacuum
//! worker for one data directory, and exposes the whole storage API
//! behind explicit transaction handles. `open` runs crash recovery
//! before anything else touches the files; `shutdown` drains dirty
//! frames and leaves a quiescent checkpoint so the next open can skip
//! the recovery passes and the index rebuild.
//!
//! Layout under `config.data_dir`: one `table_<id>.db` per heap, one
//! `index_<id>.db` per B-tree, `wal.log`, and `catalog.db`.

use crate::access::btree::BTreeIndex;
use crate::access::heap::VersionedHeap;
use crate::access::tuple::TxnId;
use crate::catalog::{ColumnMeta, IndexMeta, SystemCatalog, TableMeta};
use crate::concurrency::mvcc::{decode_row, ScanCursor, SecondaryIndex, TableRegistry, TableSet};
use crate::concurrency::{TransactionManager, Vacuum, VacuumWorker};
use crate::config::EngineConfig;
use crate::recovery::{latest_committed_catalog_image, RecoveryManager};
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::PageStore;
use crate::storage::page::FileId;
use crate::storage::wal::{Lsn, WalManager};
use crate::storage::{StorageError, StorageResult};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const WAL_FILE: &str = "wal.log";
const CATALOG_FILE: &str = "catalog.db";

/// What a DDL statement did, kept until its transaction resolves.
/// Commit retires the files a drop released; abort plays these in
/// reverse against the catalog, registry and filesystem.
enum DdlAction {
    CreatedTable {
        name: String,
        meta: TableMeta,
    },
    DroppedTable {
        name: String,
        meta: TableMeta,
        indexes: Vec<(String, IndexMeta)>,
    },
    CreatedIndex {
        name: String,
        meta: IndexMeta,
    },
    DroppedIndex {
        name: String,
        meta: IndexMeta,
    },
}

pub struct Engine {
    config: EngineConfig,
    catalog: Arc<SystemCatalog>,
    pool: BufferPoolManager,
    wal: Arc<WalManager>,
    registry: Arc<TableRegistry>,
    manager: Arc<TransactionManager>,
    vacuum_worker: Mutex<Option<VacuumWorker>>,
    ddl_undo: Mutex<HashMap<TxnId, Vec<DdlAction>>>,
}

impl Engine {
    /// Initialize a fresh data directory.
    pub fn create(config: EngineConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

        let catalog = Arc::new(
            SystemCatalog::create(&config.data_dir.join(CATALOG_FILE))
                .context("initializing catalog")?,
        );
        let pool = BufferPoolManager::new(
            Box::new(LruReplacer::new(config.buffer_pool_frames)),
            config.buffer_pool_frames,
        );
        let wal =
            Arc::new(WalManager::create(&config.data_dir.join(WAL_FILE)).context("creating WAL")?);
        pool.attach_wal(wal.clone());

        let registry = Arc::new(TableRegistry::new());
        let mut manager = TransactionManager::new(wal.clone(), registry.clone(), 1);
        manager.set_sync_commits(config.sync_on_commit);
        let manager = Arc::new(manager);

        log::info!("created engine at {}", config.data_dir.display());
        Ok(Self::assemble(config, catalog, pool, wal, registry, manager))
    }

    /// Open an existing data directory, running crash recovery first.
    pub fn open(config: EngineConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(
            SystemCatalog::open(&config.data_dir.join(CATALOG_FILE))
                .context("opening catalog")?,
        );
        let wal =
            Arc::new(WalManager::open(&config.data_dir.join(WAL_FILE)).context("opening WAL")?);

        // The catalog file lags the WAL if the process died between a
        // DDL commit record and the catalog rewrite; the newest committed
        // image in the log is the real schema
        if let Some(image) = latest_committed_catalog_image(&wal.read_all()?) {
            catalog
                .import_bytes(&image)
                .context("installing catalog image from WAL")?;
            catalog.save().context("rewriting catalog file")?;
        }

        let pool = BufferPoolManager::new(
            Box::new(LruReplacer::new(config.buffer_pool_frames)),
            config.buffer_pool_frames,
        );

        for (name, meta) in catalog.tables() {
            pool.register_file(
                meta.heap_file,
                PageStore::open(&table_path(&config.data_dir, meta.heap_file))
                    .with_context(|| format!("opening heap file of table {}", name))?,
            );
            pool.register_file(
                meta.primary_index_file,
                PageStore::open(&index_path(&config.data_dir, meta.primary_index_file))
                    .with_context(|| format!("opening primary index of table {}", name))?,
            );
            for (index_name, index_meta) in catalog.indexes_on(&name) {
                pool.register_file(
                    index_meta.file,
                    PageStore::open(&index_path(&config.data_dir, index_meta.file))
                        .with_context(|| format!("opening index {}", index_name))?,
                );
            }
        }

        pool.attach_wal(wal.clone());

        let report = RecoveryManager::new(wal.clone(), pool.clone())
            .recover()
            .context("crash recovery")?;

        // Index files are not logged; after a crash they are rebuilt
        // from the recovered heaps.
        let registry = Arc::new(TableRegistry::new());
        for (name, meta) in catalog.tables() {
            let heap = Arc::new(VersionedHeap::new(pool.clone(), meta.heap_file));
            let primary = if report.clean_shutdown {
                Arc::new(BTreeIndex::open(pool.clone(), meta.primary_index_file))
            } else {
                log::info!("rebuilding primary index of table {}", name);
                Arc::new(rebuild_index(
                    &config.data_dir,
                    &pool,
                    &heap,
                    meta.primary_index_file,
                    IndexedPart::Key,
                )?)
            };
            let mut secondaries = Vec::new();
            for (index_name, index_meta) in catalog.indexes_on(&name) {
                let index = if report.clean_shutdown {
                    BTreeIndex::open(pool.clone(), index_meta.file)
                } else {
                    log::info!("rebuilding index {}", index_name);
                    rebuild_index(
                        &config.data_dir,
                        &pool,
                        &heap,
                        index_meta.file,
                        IndexedPart::Value,
                    )?
                };
                secondaries.push(SecondaryIndex {
                    name: index_name,
                    index: Arc::new(index),
                    unique: index_meta.unique,
                });
            }
            registry.register(
                meta.heap_file,
                TableSet {
                    heap,
                    primary,
                    secondaries,
                },
            );
        }

        let mut manager =
            TransactionManager::new(wal.clone(), registry.clone(), report.next_txn_id);
        manager.set_sync_commits(config.sync_on_commit);
        let manager = Arc::new(manager);

        // Bound the next recovery scan
        wal.checkpoint(manager.active_for_checkpoint(), pool.dirty_pages())?;

        log::info!("opened engine at {}", config.data_dir.display());
        Ok(Self::assemble(config, catalog, pool, wal, registry, manager))
    }

    fn assemble(
        config: EngineConfig,
        catalog: Arc<SystemCatalog>,
        pool: BufferPoolManager,
        wal: Arc<WalManager>,
        registry: Arc<TableRegistry>,
        manager: Arc<TransactionManager>,
    ) -> Self {
        let vacuum_worker = config.vacuum_interval.map(|period| {
            VacuumWorker::spawn(Vacuum::new(manager.clone(), registry.clone()), period)
        });
        Self {
            config,
            catalog,
            pool,
            wal,
            registry,
            manager,
            vacuum_worker: Mutex::new(vacuum_worker),
            ddl_undo: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> StorageResult<TxnId> {
        self.manager.begin()
    }

    pub fn commit(&self, txn: TxnId) -> StorageResult<()> {
        // Schema changes ride the WAL ahead of the commit record: a
        // crash between the commit and the catalog rewrite replays the
        // image on the next open
        if self.ddl_undo.lock().contains_key(&txn) {
            self.manager
                .log_catalog_image(txn, self.catalog.serialize()?)?;
        }
        self.manager.commit(txn)?;

        // Past the durability point; cleanup may be lost in a crash but
        // must not fail the commit
        if let Some(actions) = self.ddl_undo.lock().remove(&txn) {
            for action in &actions {
                match action {
                    DdlAction::DroppedTable { meta, indexes, .. } => {
                        self.retire_file_best_effort(
                            meta.heap_file,
                            table_path(&self.config.data_dir, meta.heap_file),
                        );
                        self.retire_file_best_effort(
                            meta.primary_index_file,
                            index_path(&self.config.data_dir, meta.primary_index_file),
                        );
                        for (_, index_meta) in indexes {
                            self.retire_file_best_effort(
                                index_meta.file,
                                index_path(&self.config.data_dir, index_meta.file),
                            );
                        }
                    }
                    DdlAction::DroppedIndex { meta, .. } => {
                        self.retire_file_best_effort(
                            meta.file,
                            index_path(&self.config.data_dir, meta.file),
                        );
                    }
                    _ => {}
                }
            }
            if let Err(e) = self.catalog.save() {
                log::error!("catalog save after commit failed: {}", e);
            }
        }
        Ok(())
    }

    pub fn abort(&self, txn: TxnId) -> StorageResult<()> {
        if !self.manager.is_active(txn) {
            return Err(StorageError::TxnNotActive(txn));
        }
        let actions = self.ddl_undo.lock().remove(&txn).unwrap_or_default();

        // Reattach dropped tables and indexes before rolling back row
        // writes, and keep created ones alive until the rollback is
        // done; their files may still hold versions being undone.
        let mut restores = Vec::new();
        let mut removals = Vec::new();
        for action in actions.into_iter().rev() {
            match &action {
                DdlAction::DroppedTable { .. } | DdlAction::DroppedIndex { .. } => {
                    restores.push(action)
                }
                _ => removals.push(action),
            }
        }
        for action in restores {
            self.undo_ddl(action)?;
        }
        self.manager.abort(txn)?;
        for action in removals {
            self.undo_ddl(action)?;
        }
        Ok(())
    }

    pub fn get(&self, txn: TxnId, table: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.manager.get(txn, self.heap_of(table)?, key)
    }

    pub fn insert(&self, txn: TxnId, table: &str, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.manager.insert(txn, self.heap_of(table)?, key, value)
    }

    pub fn update(
        &self,
        txn: TxnId,
        table: &str,
        key: &[u8],
        value: &[u8],
    ) -> StorageResult<bool> {
        self.manager.update(txn, self.heap_of(table)?, key, value)
    }

    pub fn delete(&self, txn: TxnId, table: &str, key: &[u8]) -> StorageResult<bool> {
        self.manager.delete(txn, self.heap_of(table)?, key)
    }

    /// Lazy cursor over the rows visible to the transaction, in key
    /// order.
    pub fn scan(&self, txn: TxnId, table: &str) -> StorageResult<ScanCursor<'_>> {
        self.manager.scan(txn, self.heap_of(table)?)
    }

    pub fn create_table(
        &self,
        txn: TxnId,
        name: &str,
        columns: Vec<ColumnMeta>,
    ) -> StorageResult<()> {
        self.check_active(txn)?;
        let meta = self.catalog.create_table(name, columns)?;

        self.pool.register_file(
            meta.heap_file,
            PageStore::create(&table_path(&self.config.data_dir, meta.heap_file))?,
        );
        self.pool.register_file(
            meta.primary_index_file,
            PageStore::create(&index_path(&self.config.data_dir, meta.primary_index_file))?,
        );
        let primary = BTreeIndex::create(self.pool.clone(), meta.primary_index_file)?;

        self.registry.register(
            meta.heap_file,
            TableSet {
                heap: Arc::new(VersionedHeap::new(self.pool.clone(), meta.heap_file)),
                primary: Arc::new(primary),
                secondaries: Vec::new(),
            },
        );
        self.record_ddl(
            txn,
            DdlAction::CreatedTable {
                name: name.to_string(),
                meta,
            },
        );
        Ok(())
    }

    /// Detach a table. Its files are deleted when the transaction
    /// commits; abort brings the table back intact.
    pub fn drop_table(&self, txn: TxnId, name: &str) -> StorageResult<()> {
        self.check_active(txn)?;
        let (meta, indexes) = self.catalog.drop_table(name)?;
        self.registry.unregister(meta.heap_file);
        self.record_ddl(
            txn,
            DdlAction::DroppedTable {
                name: name.to_string(),
                meta,
                indexes,
            },
        );
        Ok(())
    }

    /// Create a secondary index over the row values and backfill it from
    /// every stored version.
    pub fn create_index(
        &self,
        txn: TxnId,
        name: &str,
        table: &str,
        column: &str,
        unique: bool,
    ) -> StorageResult<()> {
        self.check_active(txn)?;
        let table_meta = self.catalog.table(table)?;
        let meta = self.catalog.create_index(name, table, column, unique)?;

        self.pool.register_file(
            meta.file,
            PageStore::create(&index_path(&self.config.data_dir, meta.file))?,
        );
        let index = BTreeIndex::create(self.pool.clone(), meta.file)?;

        let (heap, _, _) = self.registry.get(table_meta.heap_file)?;
        for item in heap.scan()? {
            let (row, tuple) = item?;
            let (_, value) = decode_row(&tuple.payload)?;
            index.insert(&value, row)?;
        }

        self.registry.add_secondary(
            table_meta.heap_file,
            SecondaryIndex {
                name: name.to_string(),
                index: Arc::new(index),
                unique,
            },
        )?;
        self.record_ddl(
            txn,
            DdlAction::CreatedIndex {
                name: name.to_string(),
                meta,
            },
        );
        Ok(())
    }

    pub fn drop_index(&self, txn: TxnId, name: &str) -> StorageResult<()> {
        self.check_active(txn)?;
        let meta = self.catalog.drop_index(name)?;
        let table_meta = self.catalog.table(&meta.table)?;
        self.registry.remove_secondary(table_meta.heap_file, name)?;
        self.record_ddl(
            txn,
            DdlAction::DroppedIndex {
                name: name.to_string(),
                meta,
            },
        );
        Ok(())
    }

    /// Log a fuzzy checkpoint: active transactions plus the dirty page
    /// table, without flushing any pages.
    pub fn checkpoint(&self) -> StorageResult<Lsn> {
        self.wal
            .checkpoint(self.manager.active_for_checkpoint(), self.pool.dirty_pages())
    }

    /// One synchronous vacuum pass; returns reclaimed version count.
    pub fn vacuum_once(&self) -> StorageResult<usize> {
        Vacuum::new(self.manager.clone(), self.registry.clone()).run_once()
    }

    /// Flush everything and leave a quiescent checkpoint. After a clean
    /// shutdown the next `open` skips recovery and index rebuild.
    pub fn shutdown(self) -> anyhow::Result<()> {
        if let Some(mut worker) = self.vacuum_worker.lock().take() {
            worker.stop();
        }
        if self.manager.has_active() {
            log::warn!("shutting down with transactions still active");
        }
        self.wal.flush_all().context("flushing WAL")?;
        self.pool.flush_all().context("flushing dirty pages")?;
        self.catalog.save().context("saving catalog")?;
        self.wal
            .checkpoint(self.manager.active_for_checkpoint(), self.pool.dirty_pages())
            .context("writing shutdown checkpoint")?;
        log::info!("engine shut down cleanly");
        Ok(())
    }

    fn heap_of(&self, table: &str) -> StorageResult<FileId> {
        Ok(self.catalog.table(table)?.heap_file)
    }

    fn check_active(&self, txn: TxnId) -> StorageResult<()> {
        if self.manager.is_active(txn) {
            Ok(())
        } else {
            Err(StorageError::TxnNotActive(txn))
        }
    }

    fn record_ddl(&self, txn: TxnId, action: DdlAction) {
        self.ddl_undo.lock().entry(txn).or_default().push(action);
    }

    fn retire_file(&self, file: FileId, path: PathBuf) -> StorageResult<()> {
        self.pool.unregister_file(file);
        fs::remove_file(path)?;
        Ok(())
    }

    fn retire_file_best_effort(&self, file: FileId, path: PathBuf) {
        self.pool.unregister_file(file);
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("failed to remove {}: {}", path.display(), e);
        }
    }

    fn undo_ddl(&self, action: DdlAction) -> StorageResult<()> {
        match action {
            DdlAction::CreatedTable { name, meta } => {
                let _ = self.catalog.drop_table(&name)?;
                self.registry.unregister(meta.heap_file);
                self.retire_file(meta.heap_file, table_path(&self.config.data_dir, meta.heap_file))?;
                self.retire_file(
                    meta.primary_index_file,
                    index_path(&self.config.data_dir, meta.primary_index_file),
                )?;
            }
            DdlAction::CreatedIndex { name, meta } => {
                self.catalog.drop_index(&name)?;
                let heap_file = self.catalog.table(&meta.table)?.heap_file;
                self.registry.remove_secondary(heap_file, &name)?;
                self.retire_file(meta.file, index_path(&self.config.data_dir, meta.file))?;
            }
            DdlAction::DroppedTable {
                name,
                meta,
                indexes,
            } => {
                // Files were never touched; reattach the handles
                let heap = Arc::new(VersionedHeap::new(self.pool.clone(), meta.heap_file));
                let primary =
                    Arc::new(BTreeIndex::open(self.pool.clone(), meta.primary_index_file));
                let secondaries = indexes
                    .iter()
                    .map(|(index_name, index_meta)| SecondaryIndex {
                        name: index_name.clone(),
                        index: Arc::new(BTreeIndex::open(self.pool.clone(), index_meta.file)),
                        unique: index_meta.unique,
                    })
                    .collect();
                self.registry.register(
                    meta.heap_file,
                    TableSet {
                        heap,
                        primary,
                        secondaries,
                    },
                );
                self.catalog.restore_table(&name, meta, indexes);
            }
            DdlAction::DroppedIndex { name, meta } => {
                let heap_file = self.catalog.table(&meta.table)?.heap_file;
                self.registry.add_secondary(
                    heap_file,
                    SecondaryIndex {
                        name: name.clone(),
                        index: Arc::new(BTreeIndex::open(self.pool.clone(), meta.file)),
                        unique: meta.unique,
                    },
                )?;
                self.catalog.restore_index(&name, meta);
            }
        }
        Ok(())
    }
}

fn table_path(data_dir: &Path, file: FileId) -> PathBuf {
    data_dir.join(format!("table_{}.db", file.0))
}

fn index_path(data_dir: &Path, file: FileId) -> PathBuf {
    data_dir.join(format!("index_{}.db", file.0))
}

enum IndexedPart {
    Key,
    Value,
}

/// Recreate an index file from its heap. Every stored version gets an
/// entry, so uncommitted and dead versions stay reachable for visibility
/// checks exactly as they were before the crash.
fn rebuild_index(
    data_dir: &Path,
    pool: &BufferPoolManager,
    heap: &VersionedHeap,
    file: FileId,
    part: IndexedPart,
) -> StorageResult<BTreeIndex> {
    pool.unregister_file(file);
    pool.register_file(file, PageStore::create(&index_path(data_dir, file))?);
    let index = BTreeIndex::create(pool.clone(), file)?;

    for item in heap.scan()? {
        let (row, tuple) = item?;
        let (key, value) = decode_row(&tuple.payload)?;
        match part {
            IndexedPart::Key => index.insert(&key, row)?,
            IndexedPart::Value => index.insert(&value, row)?,
        }
    }
    Ok(index)
}
