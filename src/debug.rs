use crate::lsm_storage::Db;

impl Db {
    /// Print the current tree shape: runs and SSTable ids per level.
    pub fn dump_structure(&self) {
        let sv = self.inner.current_sv();
        println!(
            "memtable: {} bytes, immutables: {}",
            sv.mt.approximate_size(),
            sv.imms.len()
        );
        for level in sv.version.levels() {
            let runs: Vec<Vec<u64>> = level
                .runs()
                .iter()
                .map(|run| run.ssts().iter().map(|sst| sst.sst_id()).collect())
                .collect();
            println!("L{} ({} runs): {:?}", level.level_id(), level.run_count(), runs);
        }
    }
}
