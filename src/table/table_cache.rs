use crate::common::{make_table_file_name, FileSystem, InternalKeyComparator, Result};
use crate::iterator::AsyncIterator;
use crate::table::TableReader;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct CacheShard {
    readers: HashMap<u64, (Arc<TableReader>, u64)>,
    tick: u64,
}

/// Keeps table readers open, keyed by file number, evicting the least
/// recently touched entry past capacity. Evicted readers stay alive as long
/// as an iterator still holds them.
pub struct TableCache {
    fs: Arc<dyn FileSystem>,
    db_path: String,
    comparator: InternalKeyComparator,
    capacity: usize,
    shard: Mutex<CacheShard>,
}

impl TableCache {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        db_path: String,
        comparator: InternalKeyComparator,
        max_open_files: usize,
    ) -> Self {
        // Leave room for the WAL, manifest and info log descriptors.
        let capacity = std::cmp::max(max_open_files.saturating_sub(10), 1);
        Self {
            fs,
            db_path,
            comparator,
            capacity,
            shard: Mutex::new(CacheShard {
                readers: HashMap::default(),
                tick: 0,
            }),
        }
    }

    pub async fn get_table(&self, file_number: u64, file_size: u64) -> Result<Arc<TableReader>> {
        {
            let mut shard = self.shard.lock().unwrap();
            shard.tick += 1;
            let tick = shard.tick;
            if let Some((reader, last_used)) = shard.readers.get_mut(&file_number) {
                *last_used = tick;
                return Ok(reader.clone());
            }
        }
        let fname = make_table_file_name(&self.db_path, file_number);
        let file = self.fs.open_random_access_file(fname)?;
        let reader = Arc::new(
            TableReader::open(file, file_size as usize, self.comparator.clone()).await?,
        );
        let mut shard = self.shard.lock().unwrap();
        shard.tick += 1;
        let tick = shard.tick;
        shard.readers.insert(file_number, (reader.clone(), tick));
        while shard.readers.len() > self.capacity {
            let oldest = shard
                .readers
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(k, _)| *k)
                .unwrap();
            shard.readers.remove(&oldest);
        }
        Ok(reader)
    }

    pub async fn get(
        &self,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let reader = self.get_table(file_number, file_size).await?;
        reader.get(internal_key).await
    }

    pub async fn new_iterator(
        &self,
        file_number: u64,
        file_size: u64,
    ) -> Result<Box<dyn AsyncIterator>> {
        let reader = self.get_table(file_number, file_size).await?;
        Ok(reader.new_iterator())
    }

    /// Drops the cached reader of a deleted file.
    pub fn evict(&self, file_number: u64) {
        let mut shard = self.shard.lock().unwrap();
        shard.readers.remove(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::format::{pack_sequence_and_type, ValueType};
    use crate::common::InMemFileSystem;
    use crate::table::TableBuilder;
    use tokio::runtime::Runtime;

    fn build_table(fs: &InMemFileSystem, number: u64) -> u64 {
        let r = Runtime::new().unwrap();
        let writer = fs
            .open_writable_file(make_table_file_name("db", number))
            .unwrap();
        let mut builder = TableBuilder::new(writer, InternalKeyComparator::default(), 4096);
        let mut key = format!("key-{}", number).into_bytes();
        key.extend_from_slice(
            &pack_sequence_and_type(1, ValueType::TypeValue as u8).to_le_bytes(),
        );
        r.block_on(builder.add(&key, b"v")).unwrap();
        r.block_on(builder.finish()).unwrap();
        builder.file_size()
    }

    #[test]
    fn test_cache_hit_and_eviction() {
        let fs = InMemFileSystem::default();
        let r = Runtime::new().unwrap();
        let cache = TableCache::new(
            Arc::new(fs.clone()),
            "db".to_string(),
            InternalKeyComparator::default(),
            // Capacity clamps to 1.
            0,
        );
        let s1 = build_table(&fs, 1);
        let s2 = build_table(&fs, 2);
        let t1 = r.block_on(cache.get_table(1, s1)).unwrap();
        let t1_again = r.block_on(cache.get_table(1, s1)).unwrap();
        assert!(Arc::ptr_eq(&t1, &t1_again));
        // Loading table 2 evicts table 1; the held Arc stays usable.
        let _t2 = r.block_on(cache.get_table(2, s2)).unwrap();
        let t1_reloaded = r.block_on(cache.get_table(1, s1)).unwrap();
        assert!(!Arc::ptr_eq(&t1, &t1_reloaded));
    }

    #[test]
    fn test_missing_file() {
        let fs = InMemFileSystem::default();
        let r = Runtime::new().unwrap();
        let cache = TableCache::new(
            Arc::new(fs),
            "db".to_string(),
            InternalKeyComparator::default(),
            100,
        );
        assert!(r.block_on(cache.get_table(99, 1024)).is_err());
    }
}
