use super::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};
use crate::common::{Error, Result, SequentialFileReader};
use crate::util;
use crc32c::{crc32c, crc32c_append};
use std::ops::Range;

enum Outcome {
    Fragment(RecordType, Range<usize>),
    Eof,
    /// The file ends inside a record header or payload.
    Truncated,
    Bad(&'static str),
}

/// Reassembles logical records from a block-framed log. Two independent
/// knobs cover the callers' needs: `strict` turns damaged records into
/// `Corruption` errors instead of skipping the block, and
/// `tolerate_truncated_tail` accepts a record cut short by a crash as a
/// clean end of log.
pub struct LogReader {
    reader: Box<SequentialFileReader>,
    buffer: Vec<u8>,
    offset: usize,
    limit: usize,
    eof: bool,
    strict: bool,
    tolerate_truncated_tail: bool,
}

impl LogReader {
    /// Skips damage, accepts a short tail: the default for data logs.
    pub fn new(reader: Box<SequentialFileReader>) -> Self {
        Self::with_mode(reader, false, true)
    }

    /// Paranoid mode refuses any damage, a short tail included.
    pub fn with_paranoid(reader: Box<SequentialFileReader>, paranoid: bool) -> Self {
        Self::with_mode(reader, paranoid, !paranoid)
    }

    /// Damage is fatal but an unsynced tail is not; what a manifest needs.
    pub fn for_manifest(reader: Box<SequentialFileReader>) -> Self {
        Self::with_mode(reader, true, true)
    }

    fn with_mode(
        reader: Box<SequentialFileReader>,
        strict: bool,
        tolerate_truncated_tail: bool,
    ) -> Self {
        Self {
            reader,
            buffer: vec![0u8; BLOCK_SIZE],
            offset: 0,
            limit: 0,
            eof: false,
            strict,
            tolerate_truncated_tail,
        }
    }

    /// Reads the next logical record into `record`. Returns false at end of
    /// log.
    pub async fn read_record(&mut self, record: &mut Vec<u8>) -> Result<bool> {
        record.clear();
        let mut in_fragmented_record = false;
        loop {
            match self.read_physical_record().await? {
                Outcome::Fragment(RecordType::FullType, range) => {
                    if in_fragmented_record && self.strict {
                        return Err(Error::Corruption(
                            "partial record without end".to_string(),
                        ));
                    }
                    record.clear();
                    record.extend_from_slice(&self.buffer[range]);
                    return Ok(true);
                }
                Outcome::Fragment(RecordType::FirstType, range) => {
                    if in_fragmented_record && self.strict {
                        return Err(Error::Corruption(
                            "partial record without end".to_string(),
                        ));
                    }
                    record.clear();
                    record.extend_from_slice(&self.buffer[range]);
                    in_fragmented_record = true;
                }
                Outcome::Fragment(RecordType::MiddleType, range) => {
                    if !in_fragmented_record {
                        if self.strict {
                            return Err(Error::Corruption(
                                "missing start of fragmented record".to_string(),
                            ));
                        }
                        continue;
                    }
                    record.extend_from_slice(&self.buffer[range]);
                }
                Outcome::Fragment(RecordType::LastType, range) => {
                    if !in_fragmented_record {
                        if self.strict {
                            return Err(Error::Corruption(
                                "missing start of fragmented record".to_string(),
                            ));
                        }
                        continue;
                    }
                    record.extend_from_slice(&self.buffer[range]);
                    return Ok(true);
                }
                Outcome::Fragment(RecordType::ZeroType, _) => unreachable!(),
                Outcome::Eof => {
                    // A fragmented record without its end means the writer
                    // crashed mid-record; the tail is dropped.
                    if in_fragmented_record {
                        if !self.tolerate_truncated_tail {
                            return Err(Error::Corruption(
                                "truncated record at end of log".to_string(),
                            ));
                        }
                        record.clear();
                    }
                    return Ok(false);
                }
                Outcome::Truncated => {
                    if !self.tolerate_truncated_tail {
                        return Err(Error::Corruption(
                            "truncated record at end of log".to_string(),
                        ));
                    }
                    record.clear();
                    return Ok(false);
                }
                Outcome::Bad(msg) => {
                    if self.strict {
                        return Err(Error::Corruption(msg.to_string()));
                    }
                    in_fragmented_record = false;
                    record.clear();
                }
            }
        }
    }

    async fn read_physical_record(&mut self) -> Result<Outcome> {
        loop {
            if self.limit - self.offset < HEADER_SIZE {
                if !self.eof {
                    // Writer zero-pads block tails shorter than a header.
                    self.refill().await?;
                    continue;
                }
                if self.limit - self.offset > 0 {
                    return Ok(Outcome::Truncated);
                }
                return Ok(Outcome::Eof);
            }
            let header = &self.buffer[self.offset..(self.offset + HEADER_SIZE)];
            let a = header[4] as usize;
            let b = header[5] as usize;
            let tp = header[6];
            let length = a | (b << 8);
            if tp == RecordType::ZeroType as u8 && length == 0 {
                // Zero-padded tail of a preallocated block.
                self.offset = self.limit;
                continue;
            }
            if tp > MAX_RECORD_TYPE {
                self.offset = self.limit;
                return Ok(Outcome::Bad("unknown record type"));
            }
            if HEADER_SIZE + length > self.limit - self.offset {
                let truncated = self.eof;
                self.offset = self.limit;
                if truncated {
                    return Ok(Outcome::Truncated);
                }
                return Ok(Outcome::Bad("bad record length"));
            }
            let payload_start = self.offset + HEADER_SIZE;
            let payload = &self.buffer[payload_start..(payload_start + length)];
            let expected = util::crc_unmask(util::decode_fixed_uint32(&header[..4]));
            let actual = crc32c_append(crc32c(&[tp]), payload);
            if expected != actual {
                self.offset = self.limit;
                return Ok(Outcome::Bad("checksum mismatch"));
            }
            self.offset = payload_start + length;
            let record_type = match tp {
                1 => RecordType::FullType,
                2 => RecordType::FirstType,
                3 => RecordType::MiddleType,
                _ => RecordType::LastType,
            };
            return Ok(Outcome::Fragment(record_type, payload_start..self.offset));
        }
    }

    async fn refill(&mut self) -> Result<()> {
        let read = self.reader.read(&mut self.buffer[..BLOCK_SIZE]).await?;
        self.offset = 0;
        self.limit = read;
        if read < BLOCK_SIZE {
            self.eof = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FileSystem, InMemFileSystem};
    use crate::log::LogWriter;
    use std::path::PathBuf;
    use tokio::runtime::Runtime;

    fn write_log(fs: &InMemFileSystem, path: &str, records: &[Vec<u8>]) {
        let r = Runtime::new().unwrap();
        let file = fs.open_writable_file(PathBuf::from(path)).unwrap();
        let mut writer = LogWriter::new(file, 0);
        for rec in records {
            r.block_on(writer.add_record(rec)).unwrap();
        }
    }

    fn read_all(fs: &InMemFileSystem, path: &str, paranoid: bool) -> Result<Vec<Vec<u8>>> {
        let r = Runtime::new().unwrap();
        let file = fs.open_sequential_file(PathBuf::from(path)).unwrap();
        let mut reader = LogReader::with_paranoid(file, paranoid);
        let mut records = vec![];
        let mut buf = vec![];
        while r.block_on(reader.read_record(&mut buf))? {
            records.push(buf.clone());
        }
        Ok(records)
    }

    #[test]
    fn test_roundtrip_small_records() {
        let fs = InMemFileSystem::default();
        let records = vec![b"one".to_vec(), b"".to_vec(), b"three".to_vec()];
        write_log(&fs, "wal", &records);
        assert_eq!(read_all(&fs, "wal", true).unwrap(), records);
    }

    #[test]
    fn test_roundtrip_spanning_records() {
        let fs = InMemFileSystem::default();
        // Larger than one block: emitted as FIRST/MIDDLE/LAST fragments.
        let records = vec![
            vec![7u8; 3 * BLOCK_SIZE],
            vec![8u8; BLOCK_SIZE - HEADER_SIZE],
            b"tail".to_vec(),
        ];
        write_log(&fs, "wal", &records);
        assert_eq!(read_all(&fs, "wal", true).unwrap(), records);
    }

    #[test]
    fn test_truncated_tail() {
        let fs = InMemFileSystem::default();
        let records = vec![b"first".to_vec(), b"second".to_vec()];
        write_log(&fs, "wal", &records);
        let mut data = fs.read_file_content(PathBuf::from("wal")).unwrap();
        data.truncate(data.len() - 3);
        let trunc = fs.open_writable_file(PathBuf::from("wal2")).unwrap();
        let r = Runtime::new().unwrap();
        let mut trunc = trunc;
        r.block_on(trunc.append(&data)).unwrap();

        // Tolerant mode recovers everything before the damaged tail.
        assert_eq!(
            read_all(&fs, "wal2", false).unwrap(),
            vec![b"first".to_vec()]
        );
        // Paranoid mode refuses.
        assert!(matches!(
            read_all(&fs, "wal2", true),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_corrupt_checksum_skips_block() {
        let fs = InMemFileSystem::default();
        write_log(&fs, "wal", &[b"payload".to_vec()]);
        let mut data = fs.read_file_content(PathBuf::from("wal")).unwrap();
        // Flip a payload byte so the checksum no longer matches.
        let l = data.len();
        data[l - 1] ^= 0xff;
        let r = Runtime::new().unwrap();
        let mut f = fs.open_writable_file(PathBuf::from("wal2")).unwrap();
        r.block_on(f.append(&data)).unwrap();

        assert_eq!(read_all(&fs, "wal2", false).unwrap(), Vec::<Vec<u8>>::new());
        assert!(matches!(
            read_all(&fs, "wal2", true),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_manifest_mode_tolerates_tail_but_not_damage() {
        let fs = InMemFileSystem::default();
        write_log(&fs, "m", &[b"edit-1".to_vec(), b"edit-2".to_vec()]);
        let data = fs.read_file_content(PathBuf::from("m")).unwrap();
        let r = Runtime::new().unwrap();

        // Tail cut mid-record: clean end after the first record.
        let mut f = fs.open_writable_file(PathBuf::from("m2")).unwrap();
        r.block_on(f.append(&data[..data.len() - 3])).unwrap();
        let file = fs.open_sequential_file(PathBuf::from("m2")).unwrap();
        let mut reader = LogReader::for_manifest(file);
        let mut buf = vec![];
        assert!(r.block_on(reader.read_record(&mut buf)).unwrap());
        assert_eq!(buf, b"edit-1");
        assert!(!r.block_on(reader.read_record(&mut buf)).unwrap());

        // A flipped byte is fatal.
        let mut bad = data.clone();
        bad[10] ^= 0x01;
        let mut f = fs.open_writable_file(PathBuf::from("m3")).unwrap();
        r.block_on(f.append(&bad)).unwrap();
        let file = fs.open_sequential_file(PathBuf::from("m3")).unwrap();
        let mut reader = LogReader::for_manifest(file);
        assert!(matches!(
            r.block_on(reader.read_record(&mut buf)),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let fs = InMemFileSystem::default();
        // A fragment length is encoded in 16 bits; the writer must split
        // anything larger.
        let records = vec![vec![0xabu8; 0xffff + 1]];
        write_log(&fs, "wal", &records);
        assert_eq!(read_all(&fs, "wal", true).unwrap(), records);
    }
}
