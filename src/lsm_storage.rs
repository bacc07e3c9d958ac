use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{error, info};

use crate::cache::{BlockCache, CacheOptions};
use crate::compact::{Compaction, CompactionJob, CompactionPicker};
use crate::error::StorageError;
use crate::file::{FileNameGenerator, FileReader, FileWriter};
use crate::iterators::concat_iterator::SstConcatIterator;
use crate::iterators::merge_iterator::MergeIterator;
use crate::level::{Level, SortedRun};
use crate::lsm_iterator::DbIterator;
use crate::mem_table::MemTable;
use crate::table::{SsTable, SstInfo};
use crate::version::{SuperVersion, Version};

/// Configurable engine options. `db_path` is required; everything else has
/// the documented default.
#[derive(Clone, Debug)]
pub struct LsmStorageOptions {
    /// directory holding the database
    pub db_path: PathBuf,
    /// target SSTable and memtable size
    pub sst_file_size: u64,
    /// target data block size
    pub block_size: usize,
    /// file writer buffer
    pub write_buffer_size: usize,
    /// bypass the OS page cache where supported
    pub use_direct_io: bool,
    pub enable_bloom_filter: bool,
    /// true: create an empty database; false: open an existing one
    pub create_new: bool,
    /// write stall threshold on immutable memtables
    pub max_immutable_count: usize,
    /// "tiered" or "leveled"
    pub compaction_strategy_name: String,
    /// L0 run count that triggers compaction
    pub level0_compaction_trigger: usize,
    /// L0 run count that stalls writers
    pub level0_stop_writes_trigger: usize,
    /// per-level growth factor
    pub compaction_size_ratio: u64,
    pub bloom_bits_per_key: usize,
    pub cache: CacheOptions,
}

impl LsmStorageOptions {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            sst_file_size: 64 * 1024 * 1024,
            block_size: 4 * 1024,
            write_buffer_size: 1024 * 1024,
            use_direct_io: false,
            enable_bloom_filter: true,
            create_new: true,
            max_immutable_count: 4,
            compaction_strategy_name: "tiered".to_string(),
            level0_compaction_trigger: 4,
            level0_stop_writes_trigger: 20,
            compaction_size_ratio: 10,
            bloom_bits_per_key: 10,
            cache: CacheOptions::default(),
        }
    }
}

/// Flush/compaction bookkeeping shared with the background threads,
/// guarded by the db mutex.
struct DbState {
    flush_flag: bool,
    compact_flag: bool,
    stop: bool,
}

pub(crate) struct LsmStorageInner {
    pub(crate) options: Arc<LsmStorageOptions>,
    seq: AtomicU64,
    /// serializes writers and sequence assignment
    write_mutex: Mutex<()>,
    /// brief bookkeeping lock for switches, stalls and install points
    db_state: Mutex<DbState>,
    flush_cv: Condvar,
    compact_cv: Condvar,
    /// the current SuperVersion; readers copy the handle and release
    sv: RwLock<Arc<SuperVersion>>,
    pub(crate) block_cache: Arc<BlockCache>,
    filename_gen: FileNameGenerator,
    picker: CompactionPicker,
}

impl LsmStorageInner {
    fn open(options: LsmStorageOptions) -> Result<Self> {
        let picker = CompactionPicker::from_options(&options)?;
        let block_cache = Arc::new(BlockCache::new(options.cache.clone()));
        let (seq, next_sst_id, version) = if options.create_new {
            std::fs::create_dir_all(&options.db_path)
                .with_context(|| format!("fail to create {}", options.db_path.display()))?;
            (0, 0, Arc::new(Version::new_empty()))
        } else {
            if !options.db_path.is_dir() {
                bail!(StorageError::InvalidArgument(format!(
                    "no database at {}",
                    options.db_path.display()
                )));
            }
            Self::load_metadata(&options, &block_cache)?
        };
        let sv = SuperVersion::new(
            Arc::new(MemTable::create()),
            Vec::new(),
            version,
        );
        info!("opened database: {}", sv.describe());
        Ok(Self {
            filename_gen: FileNameGenerator::new(&options.db_path, next_sst_id),
            options: Arc::new(options),
            seq: AtomicU64::new(seq),
            write_mutex: Mutex::new(()),
            db_state: Mutex::new(DbState {
                flush_flag: false,
                compact_flag: false,
                stop: false,
            }),
            flush_cv: Condvar::new(),
            compact_cv: Condvar::new(),
            sv: RwLock::new(Arc::new(sv)),
            block_cache,
            picker,
        })
    }

    /* ---------------- read/write path ---------------- */

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _write_guard = self.write_mutex.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let sv = self.current_sv();
        sv.mt.put(key, seq, value);
        if sv.mt.approximate_size() as u64 > self.options.sst_file_size {
            self.switch_memtable(false);
        }
        Ok(())
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        let _write_guard = self.write_mutex.lock();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let sv = self.current_sv();
        sv.mt.del(key, seq);
        if sv.mt.approximate_size() as u64 > self.options.sst_file_size {
            self.switch_memtable(false);
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let sv = self.current_sv();
        let seq = self.seq.load(Ordering::SeqCst);
        Ok(sv.get(key, seq)?.into_option())
    }

    pub fn begin(&self) -> Result<DbIterator> {
        let sv = self.current_sv();
        let seq = self.seq.load(Ordering::SeqCst);
        DbIterator::create_and_seek_to_first(sv, seq)
    }

    pub fn seek(&self, key: &[u8]) -> Result<DbIterator> {
        let sv = self.current_sv();
        let seq = self.seq.load(Ordering::SeqCst);
        DbIterator::create_and_seek_to_key(sv, seq, key)
    }

    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub(crate) fn current_sv(&self) -> Arc<SuperVersion> {
        self.sv.read().clone()
    }

    fn install_sv(&self, sv: Arc<SuperVersion>) {
        *self.sv.write() = sv;
    }

    /* ---------------- memtable switching ---------------- */

    /// Release the db lock, sleep briefly and reacquire; the stop-write
    /// stall used by writers and the flush thread.
    fn stop_write<'a>(&'a self, guard: MutexGuard<'a, DbState>) -> MutexGuard<'a, DbState> {
        drop(guard);
        std::thread::sleep(Duration::from_millis(10));
        self.db_state.lock()
    }

    /// Freeze the mutable memtable when it is over the size threshold (or
    /// unconditionally when `force` and non-empty), installing a fresh one.
    /// Stalls while the immutable list is at `max_immutable_count`.
    fn switch_memtable(&self, force: bool) {
        let mut guard = self.db_state.lock();
        loop {
            let sv = self.current_sv();
            if sv.imms.len() < self.options.max_immutable_count {
                break;
            }
            drop(sv);
            guard = self.stop_write(guard);
        }
        let sv = self.current_sv();
        if (force && !sv.mt.is_empty())
            || sv.mt.approximate_size() as u64 > self.options.sst_file_size
        {
            let mut imms = Vec::with_capacity(sv.imms.len() + 1);
            imms.push(sv.mt.clone());
            imms.extend(sv.imms.iter().cloned());
            let new_sv = Arc::new(SuperVersion::new(
                Arc::new(MemTable::create()),
                imms,
                sv.version.clone(),
            ));
            info!("memtable switched: {}", new_sv.describe());
            self.install_sv(new_sv);
            self.flush_cv.notify_one();
        }
        drop(guard);
    }

    pub fn flush_all(&self) -> Result<()> {
        self.switch_memtable(true);
        loop {
            let sv = self.current_sv();
            if sv.mt.is_empty() && sv.imms.is_empty() {
                return Ok(());
            }
            drop(sv);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn wait_for_flush_and_compaction(&self) -> Result<()> {
        loop {
            let idle = {
                let guard = self.db_state.lock();
                let sv = self.current_sv();
                !guard.flush_flag && !guard.compact_flag && sv.imms.is_empty()
            };
            if idle {
                // nothing running; done once the picker is out of work too
                let version = self.current_sv().version.clone();
                if self.picker.pick(&version).is_none() {
                    return Ok(());
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /* ---------------- background flush ---------------- */

    fn pick_memtables(&self) -> Vec<Arc<MemTable>> {
        self.current_sv()
            .imms
            .iter()
            .filter(|m| !m.flush_in_progress() && !m.flush_complete())
            .cloned()
            .collect()
    }

    fn flush_thread(self: &Arc<Self>) {
        loop {
            let mut guard = self.db_state.lock();
            if guard.stop {
                guard.flush_flag = false;
                return;
            }
            // second backpressure trigger: too many L0 runs
            loop {
                if guard.stop {
                    guard.flush_flag = false;
                    return;
                }
                let l0_runs = {
                    let sv = self.current_sv();
                    sv.version
                        .levels()
                        .first()
                        .map(|l| l.run_count())
                        .unwrap_or(0)
                };
                if l0_runs < self.options.level0_stop_writes_trigger {
                    break;
                }
                guard = self.stop_write(guard);
            }
            let imms = self.pick_memtables();
            if imms.is_empty() {
                guard.flush_flag = false;
                self.flush_cv.wait(&mut guard);
                continue;
            }
            guard.flush_flag = true;
            for imm in &imms {
                imm.set_flush_in_progress(true);
            }
            drop(guard);

            // write one sorted run per memtable, newest first
            let mut runs = Vec::new();
            let mut failed = None;
            for imm in &imms {
                let job = CompactionJob::new(&self.filename_gen, &self.options);
                let result = job.run(imm.iter()).and_then(|infos| {
                    if infos.is_empty() {
                        Ok(None)
                    } else {
                        SortedRun::open(
                            infos,
                            Some(self.block_cache.clone()),
                            self.options.use_direct_io,
                        )
                        .map(Some)
                    }
                });
                match result {
                    Ok(Some(run)) => runs.push(Arc::new(run)),
                    Ok(None) => {}
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }

            let mut guard = self.db_state.lock();
            if let Some(e) = failed {
                error!("flush failed, will retry: {:#}", e);
                // release the picked memtables back to the queue and drop
                // whatever partial output this round produced
                for imm in &imms {
                    imm.set_flush_in_progress(false);
                }
                for run in &runs {
                    run.set_remove_on_drop(true);
                }
                runs.clear();
                guard.flush_flag = false;
                drop(guard);
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
            for imm in &imms {
                imm.set_flush_complete(true);
            }
            let old = self.current_sv();
            let new_imms: Vec<_> = old
                .imms
                .iter()
                .filter(|m| !m.flush_complete())
                .cloned()
                .collect();
            let new_version = Arc::new(old.version.prepend_runs(0, runs));
            let new_sv = Arc::new(SuperVersion::new(old.mt.clone(), new_imms, new_version));
            info!("flush installed: {}", new_sv.describe());
            self.install_sv(new_sv);
            guard.flush_flag = false;
            drop(guard);
            self.compact_cv.notify_one();
        }
    }

    /* ---------------- background compaction ---------------- */

    fn compaction_thread(self: &Arc<Self>) {
        loop {
            let mut guard = self.db_state.lock();
            if guard.stop {
                guard.compact_flag = false;
                return;
            }
            let version = self.current_sv().version.clone();
            let Some(compaction) = self.picker.pick(&version) else {
                guard.compact_flag = false;
                self.compact_cv.wait(&mut guard);
                continue;
            };
            guard.compact_flag = true;
            drop(guard);
            if let Err(e) = self.run_compaction(&compaction) {
                error!("compaction failed, will retry: {:#}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    fn run_compaction(&self, compaction: &Compaction) -> Result<()> {
        info!(
            "compaction: L{} -> L{}, {} runs + {} tables, merging {} target tables{}",
            compaction.src_level,
            compaction.target_level,
            compaction.input_runs.len(),
            compaction.input_ssts.len(),
            compaction.target_overlap.len(),
            if compaction.is_trivial_move {
                " (trivial move)"
            } else {
                ""
            }
        );
        let new_ssts = if compaction.is_trivial_move {
            Vec::new()
        } else {
            let mut children = Vec::new();
            for run in &compaction.input_runs {
                children.push(Box::new(run.iter()?));
            }
            if !compaction.input_ssts.is_empty() {
                children.push(Box::new(SstConcatIterator::create_and_seek_to_first(
                    compaction.input_ssts.clone(),
                )?));
            }
            if !compaction.target_overlap.is_empty() {
                children.push(Box::new(SstConcatIterator::create_and_seek_to_first(
                    compaction.target_overlap.clone(),
                )?));
            }
            let job = CompactionJob::new(&self.filename_gen, &self.options);
            let infos = job.run(MergeIterator::create(children))?;
            self.open_ssts(infos)?
        };

        // install under the db lock; the current version may have gained L0
        // runs since the pick
        let guard = self.db_state.lock();
        let old = self.current_sv();
        let new_version = Arc::new(compaction.apply(&old.version, new_ssts));
        let new_sv = Arc::new(SuperVersion::new(
            old.mt.clone(),
            old.imms.clone(),
            new_version,
        ));
        info!("compaction installed: {}", new_sv.describe());
        self.install_sv(new_sv);
        if !compaction.is_trivial_move {
            // old files die once the last SuperVersion referencing them drops
            for sst in compaction.obsolete_ssts() {
                sst.set_remove_on_drop(true);
            }
        }
        drop(guard);
        Ok(())
    }

    fn open_ssts(&self, infos: Vec<SstInfo>) -> Result<Vec<Arc<SsTable>>> {
        let mut ssts = Vec::with_capacity(infos.len());
        let paths: Vec<_> = infos.iter().map(|i| i.filename.clone()).collect();
        for info in infos {
            match SsTable::open(
                info,
                Some(self.block_cache.clone()),
                self.options.use_direct_io,
            ) {
                Ok(sst) => ssts.push(Arc::new(sst)),
                Err(e) => {
                    // the freshly written outputs are garbage now
                    drop(ssts);
                    for path in paths {
                        let _ = std::fs::remove_file(&path);
                    }
                    return Err(e);
                }
            }
        }
        Ok(ssts)
    }

    /* ---------------- persistence ---------------- */

    pub fn save(&self) -> Result<()> {
        self.flush_all()?;
        self.save_metadata()
    }

    fn save_metadata(&self) -> Result<()> {
        let path = self.options.db_path.join("metadata");
        let mut writer = FileWriter::create(&path, 1 << 20, self.options.use_direct_io)?;
        let sv = self.current_sv();
        writer.append_u64(self.seq.load(Ordering::SeqCst))?;
        writer.append_u64(self.filename_gen.current())?;
        let levels = sv.version.levels();
        writer.append_u64(levels.len() as u64)?;
        for level in levels {
            writer.append_u64(level.level_id() as u64)?;
            writer.append_u64(level.run_count() as u64)?;
            for run in level.runs() {
                writer.append_u64(run.sst_count() as u64)?;
                for sst in run.ssts() {
                    let info = sst.info();
                    let filename = info.filename.to_string_lossy();
                    writer.append_u64(info.count)?;
                    writer.append_u64(info.size)?;
                    writer.append_u64(info.sst_id)?;
                    writer.append_u64(info.index_offset)?;
                    writer.append_u64(info.bloom_offset)?;
                    writer.append_u64(filename.len() as u64)?;
                    writer.append(filename.as_bytes())?;
                }
            }
        }
        writer.sync()?;
        info!("metadata saved: {}", sv.describe());
        Ok(())
    }

    fn load_metadata(
        options: &LsmStorageOptions,
        block_cache: &Arc<BlockCache>,
    ) -> Result<(u64, u64, Arc<Version>)> {
        let path = options.db_path.join("metadata");
        let corrupt = |e: anyhow::Error| {
            anyhow::Error::from(StorageError::Corruption(format!(
                "metadata at {}: {:#}",
                path.display(),
                e
            )))
        };
        let mut reader =
            FileReader::open(&path, 1 << 20, options.use_direct_io).map_err(|e| corrupt(e))?;
        let mut inner = || -> Result<(u64, u64, Arc<Version>)> {
            let seq = reader.read_u64()?;
            let next_sst_id = reader.read_u64()?;
            let level_count = reader.read_u64()?;
            // counts and lengths come from disk; never preallocate from them
            let mut levels = Vec::new();
            for _ in 0..level_count {
                let level_id = reader.read_u64()? as usize;
                let run_count = reader.read_u64()?;
                let mut runs = Vec::new();
                for _ in 0..run_count {
                    let sst_count = reader.read_u64()?;
                    let mut infos = Vec::new();
                    for _ in 0..sst_count {
                        let count = reader.read_u64()?;
                        let size = reader.read_u64()?;
                        let sst_id = reader.read_u64()?;
                        let index_offset = reader.read_u64()?;
                        let bloom_offset = reader.read_u64()?;
                        let filename_len = reader.read_u64()?;
                        if filename_len > 4096 {
                            return Err(StorageError::Corruption(
                                "implausible filename length in metadata".into(),
                            )
                            .into());
                        }
                        let filename = String::from_utf8(reader.read_bytes(filename_len as usize)?)
                            .map_err(|_| {
                                StorageError::Corruption("bad filename in metadata".into())
                            })?;
                        infos.push(SstInfo {
                            size,
                            count,
                            sst_id,
                            index_offset,
                            bloom_offset,
                            filename: filename.into(),
                        });
                    }
                    runs.push(Arc::new(SortedRun::open(
                        infos,
                        Some(block_cache.clone()),
                        options.use_direct_io,
                    )?));
                }
                levels.push(Level::new(level_id, runs));
            }
            Ok((seq, next_sst_id, Arc::new(Version::with_levels(levels))))
        };
        inner().map_err(|e| corrupt(e))
    }
}

/// The public engine handle. Owns the background threads; dropping it
/// flushes, stops the threads and persists metadata.
pub struct Db {
    pub(crate) inner: Arc<LsmStorageInner>,
    flush_thread: Option<JoinHandle<()>>,
    compaction_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish()
    }
}

impl Db {
    pub fn open(options: LsmStorageOptions) -> Result<Db> {
        let inner = Arc::new(LsmStorageInner::open(options)?);
        let flush_inner = inner.clone();
        let flush_thread = std::thread::Builder::new()
            .name("lsm-flush".to_string())
            .spawn(move || flush_inner.flush_thread())?;
        let compact_inner = inner.clone();
        let compaction_thread = std::thread::Builder::new()
            .name("lsm-compaction".to_string())
            .spawn(move || compact_inner.compaction_thread())?;
        Ok(Db {
            inner,
            flush_thread: Some(flush_thread),
            compaction_thread: Some(compaction_thread),
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.inner.del(key)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.get(key)
    }

    /// Iterator over the whole database at the current snapshot.
    pub fn begin(&self) -> Result<DbIterator> {
        self.inner.begin()
    }

    /// Iterator positioned at the first visible key not smaller than `key`.
    pub fn seek(&self, key: &[u8]) -> Result<DbIterator> {
        self.inner.seek(key)
    }

    /// Flush all in-memory state and persist the metadata file.
    pub fn save(&self) -> Result<()> {
        self.inner.save()
    }

    /// Force-switch even a non-full memtable and block until every
    /// memtable has been flushed.
    pub fn flush_all(&self) -> Result<()> {
        self.inner.flush_all()
    }

    /// Block until no flush or compaction is running or pending.
    pub fn wait_for_flush_and_compaction(&self) -> Result<()> {
        self.inner.wait_for_flush_and_compaction()
    }

    pub fn current_seq(&self) -> u64 {
        self.inner.current_seq()
    }

    pub fn options(&self) -> &LsmStorageOptions {
        &self.inner.options
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.inner.flush_all() {
            error!("flush on shutdown failed: {:#}", e);
        }
        {
            let mut guard = self.inner.db_state.lock();
            guard.stop = true;
        }
        self.inner.flush_cv.notify_all();
        self.inner.compact_cv.notify_all();
        if let Some(t) = self.flush_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.compaction_thread.take() {
            let _ = t.join();
        }
        if let Err(e) = self.inner.save_metadata() {
            error!("metadata save on shutdown failed: {:#}", e);
        }
    }
}
