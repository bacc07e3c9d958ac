use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::iterators::StorageIterator;
use crate::lsm_iterator::DbIterator;
use crate::lsm_storage::{Db, LsmStorageOptions};

/// Minimal table description kept by the adaptor. Rows reach the engine as
/// opaque value bytes keyed by their serialized primary key; the adaptor
/// does not interpret either.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DbSchema {
    pub tables: Vec<TableSchema>,
}

impl DbSchema {
    fn add_table(&mut self, schema: TableSchema) {
        self.tables.push(schema);
    }

    fn remove_table(&mut self, name: &str) {
        self.tables.retain(|t| t.name != name);
    }
}

/// One bound of a range scan: a key, an unbounded flag and an inclusive
/// flag; the two bounds together produce the nine interval shapes.
#[derive(Clone, Debug)]
pub struct ScanBound {
    pub key: Bytes,
    pub unbounded: bool,
    pub inclusive: bool,
}

impl ScanBound {
    pub fn unbounded() -> Self {
        Self {
            key: Bytes::new(),
            unbounded: true,
            inclusive: false,
        }
    }

    pub fn included(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            unbounded: false,
            inclusive: true,
        }
    }

    pub fn excluded(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            unbounded: false,
            inclusive: false,
        }
    }
}

struct TableHandle {
    db: Db,
    tick: AtomicU64,
}

/// What the adaptor persists beside the per-table engine directories.
#[derive(Serialize, Deserialize, Default)]
struct StorageManifest {
    schema: DbSchema,
    ticks: BTreeMap<String, u64>,
}

/// Per-table storage adaptor consumed by the enclosing database: each table
/// is its own engine instance under `<root>/tables/`, with a JSON manifest
/// at `<root>/schema` carrying the table list and modification ticks.
pub struct LsmStorage {
    db_path: PathBuf,
    options: LsmStorageOptions,
    tables: Mutex<BTreeMap<String, Arc<TableHandle>>>,
    schema: Mutex<DbSchema>,
}

impl LsmStorage {
    pub fn open(
        path: impl Into<PathBuf>,
        create_if_missing: bool,
        options: LsmStorageOptions,
    ) -> Result<LsmStorage> {
        let path = path.into();
        if !path.exists() {
            if !create_if_missing {
                bail!(StorageError::InvalidArgument(format!(
                    "cannot find database under {}",
                    path.display()
                )));
            }
            std::fs::create_dir_all(path.join("tables"))?;
            return Ok(LsmStorage {
                db_path: path,
                options,
                tables: Mutex::new(BTreeMap::new()),
                schema: Mutex::new(DbSchema::default()),
            });
        }
        let manifest_path = path.join("schema");
        let raw = std::fs::read(&manifest_path)
            .with_context(|| format!("fail to read {}", manifest_path.display()))?;
        let manifest: StorageManifest = serde_json::from_slice(&raw).map_err(|e| {
            StorageError::Corruption(format!("schema at {}: {}", manifest_path.display(), e))
        })?;
        let mut tables = BTreeMap::new();
        for table in &manifest.schema.tables {
            let mut table_options = options.clone();
            table_options.create_new = false;
            table_options.db_path = Self::table_path(&path, &table.name);
            let db = Db::open(table_options)?;
            let tick = manifest.ticks.get(&table.name).copied().unwrap_or(0);
            tables.insert(
                table.name.clone(),
                Arc::new(TableHandle {
                    db,
                    tick: AtomicU64::new(tick),
                }),
            );
        }
        Ok(LsmStorage {
            db_path: path,
            options,
            tables: Mutex::new(tables),
            schema: Mutex::new(manifest.schema),
        })
    }

    fn table_path(root: &Path, name: &str) -> PathBuf {
        root.join("tables").join(format!("t'{}'", name))
    }

    fn table(&self, name: &str) -> Result<Arc<TableHandle>> {
        self.tables.lock().get(name).cloned().ok_or_else(|| {
            StorageError::InvalidArgument(format!("no such table {:?}", name)).into()
        })
    }

    /// Persist the schema manifest and every table's engine state.
    pub fn save(&self) -> Result<()> {
        let tables = self.tables.lock();
        let manifest = StorageManifest {
            schema: self.schema.lock().clone(),
            ticks: tables
                .iter()
                .map(|(name, t)| (name.clone(), t.tick.load(Ordering::SeqCst)))
                .collect(),
        };
        let raw = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(self.db_path.join("schema"), raw)?;
        for table in tables.values() {
            table.db.save()?;
        }
        Ok(())
    }

    pub fn create(&self, schema: TableSchema) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.contains_key(&schema.name) {
            bail!(StorageError::InvalidArgument(format!(
                "table {:?} already exists",
                schema.name
            )));
        }
        let mut table_options = self.options.clone();
        table_options.create_new = true;
        table_options.db_path = Self::table_path(&self.db_path, &schema.name);
        let db = Db::open(table_options)?;
        tables.insert(
            schema.name.clone(),
            Arc::new(TableHandle {
                db,
                tick: AtomicU64::new(0),
            }),
        );
        self.schema.lock().add_table(schema);
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let handle = self.tables.lock().remove(name);
        if let Some(handle) = handle {
            // shut the engine down before removing its directory
            drop(handle);
            std::fs::remove_dir_all(Self::table_path(&self.db_path, name))?;
            self.schema.lock().remove_table(name);
        }
        Ok(())
    }

    /// Full-table scan in primary-key order.
    pub fn iter(&self, name: &str) -> Result<RangeTableIterator> {
        self.range_iter(name, ScanBound::unbounded(), ScanBound::unbounded())
    }

    /// Range scan over `[lower, upper]` per the bound flags.
    pub fn range_iter(
        &self,
        name: &str,
        lower: ScanBound,
        upper: ScanBound,
    ) -> Result<RangeTableIterator> {
        let table = self.table(name)?;
        RangeTableIterator::create(&table.db, lower, upper)
    }

    pub fn modify(&self, name: &str) -> Result<ModifyHandle> {
        Ok(ModifyHandle {
            table: self.table(name)?,
        })
    }

    pub fn search(&self, name: &str) -> Result<SearchHandle> {
        Ok(SearchHandle {
            table: self.table(name)?,
        })
    }

    /// Number of successful inserts into the table since creation.
    pub fn ticks(&self, name: &str) -> Result<u64> {
        Ok(self.table(name)?.tick.load(Ordering::SeqCst))
    }

    pub fn schema(&self) -> DbSchema {
        self.schema.lock().clone()
    }
}

impl Drop for LsmStorage {
    fn drop(&mut self) {
        if let Err(e) = self.save() {
            tracing::error!("storage save on shutdown failed: {:#}", e);
        }
    }
}

/// Write access to one table.
pub struct ModifyHandle {
    table: Arc<TableHandle>,
}

impl ModifyHandle {
    /// Insert a fresh row; returns false (without writing) when the key
    /// already exists. Successful inserts bump the table tick.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.table.db.get(key)?.is_some() {
            return Ok(false);
        }
        self.table.db.put(key, value)?;
        self.table.tick.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.table.db.put(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.table.db.del(key)
    }
}

/// Point-lookup access to one table.
pub struct SearchHandle {
    table: Arc<TableHandle>,
}

impl SearchHandle {
    pub fn search(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.table.db.get(key)
    }
}

/// Snapshot iterator over a key range of one table.
pub struct RangeTableIterator {
    iter: DbIterator,
    upper: ScanBound,
}

impl RangeTableIterator {
    fn create(db: &Db, lower: ScanBound, upper: ScanBound) -> Result<Self> {
        let mut iter = if lower.unbounded {
            db.begin()?
        } else {
            db.seek(&lower.key)?
        };
        if !lower.unbounded && !lower.inclusive && iter.is_valid() && iter.key() == &lower.key[..] {
            iter.next()?;
        }
        Ok(Self { iter, upper })
    }

    fn within_upper(&self) -> bool {
        if self.upper.unbounded {
            return true;
        }
        if self.upper.inclusive {
            self.iter.key() <= &self.upper.key[..]
        } else {
            self.iter.key() < &self.upper.key[..]
        }
    }
}

impl StorageIterator for RangeTableIterator {
    type KeyType<'a> = &'a [u8];

    fn is_valid(&self) -> bool {
        self.iter.is_valid() && self.within_upper()
    }

    fn key(&self) -> &[u8] {
        self.iter.key()
    }

    fn value(&self) -> &[u8] {
        self.iter.value()
    }

    fn next(&mut self) -> Result<()> {
        self.iter.next()
    }
}
