#![allow(dead_code)]

//! An embeddable, ordered key/value storage engine: writes go to a
//! write-ahead log and an in-memory skip list, flow into immutable sorted
//! table files, and are merged down a level hierarchy by a background
//! compactor. Reads see a consistent sequence-numbered snapshot.

mod common;
mod compaction;
mod db;
mod iterator;
mod log;
mod manifest;
mod memtable;
mod options;
mod table;
mod util;
mod version;
mod wal;
mod write_batch;

#[cfg(unix)]
pub use common::SyncPosixFileSystem;
pub use common::{
    BytewiseComparator, Error, FileSystem, InMemFileSystem, InternalKeyComparator, KeyComparator,
    RandomAccessFile, Result, SequentialFile, WritableFile,
};
pub use db::Db;
pub use iterator::DbIterator;
pub use options::{Options, ReadOptions, WriteOptions};
pub use version::Snapshot;
pub use write_batch::WriteBatch;
