use super::FileMetaData;
use crate::common::{Error, Result};
use crate::util::{
    get_length_prefixed_slice, get_var_uint32, get_var_uint64, put_length_prefixed_slice,
    put_var_uint32, put_varint32varint64,
};

// Tag numbers written to the manifest; they must never change.
#[repr(u32)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
enum Tag {
    Comparator = 1,
    LogNumber = 2,
    NextFileNumber = 3,
    LastSequence = 4,
    CompactPointer = 5,
    DeletedFile = 6,
    NewFile = 7,
}

/// The delta between two versions: files added and removed per level plus the
/// bookkeeping numbers. A manifest is nothing but a log of these.
#[derive(Clone, Default, Debug, Eq, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    /// `(level, internal key)` where the next size compaction of that level
    /// should start.
    pub compact_pointers: Vec<(u32, Vec<u8>)>,
    pub deleted_files: Vec<(u32, u64)>,
    pub new_files: Vec<FileMetaData>,
}

impl VersionEdit {
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string());
    }

    pub fn set_log_number(&mut self, log_number: u64) {
        self.log_number = Some(log_number);
    }

    pub fn set_next_file(&mut self, file_number: u64) {
        self.next_file_number = Some(file_number);
    }

    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    pub fn set_compact_pointer(&mut self, level: u32, key: &[u8]) {
        self.compact_pointers.push((level, key.to_vec()));
    }

    pub fn add_file(
        &mut self,
        level: u32,
        number: u64,
        file_size: u64,
        smallest: &[u8],
        largest: &[u8],
    ) {
        let mut f = FileMetaData::new(number, level, smallest.to_vec(), largest.to_vec());
        f.file_size = file_size;
        self.new_files.push(f);
    }

    pub fn delete_file(&mut self, level: u32, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        if let Some(name) = &self.comparator_name {
            put_var_uint32(buf, Tag::Comparator as u32);
            put_length_prefixed_slice(buf, name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            put_varint32varint64(buf, Tag::LogNumber as u32, log_number);
        }
        if let Some(next_file) = self.next_file_number {
            put_varint32varint64(buf, Tag::NextFileNumber as u32, next_file);
        }
        if let Some(last_sequence) = self.last_sequence {
            put_varint32varint64(buf, Tag::LastSequence as u32, last_sequence);
        }
        for (level, key) in &self.compact_pointers {
            put_var_uint32(buf, Tag::CompactPointer as u32);
            put_var_uint32(buf, *level);
            put_length_prefixed_slice(buf, key);
        }
        for (level, number) in &self.deleted_files {
            put_var_uint32(buf, Tag::DeletedFile as u32);
            put_var_uint32(buf, *level);
            crate::util::put_var_uint64(buf, *number);
        }
        for f in &self.new_files {
            put_var_uint32(buf, Tag::NewFile as u32);
            put_var_uint32(buf, f.level);
            crate::util::put_var_uint64(buf, f.number);
            crate::util::put_var_uint64(buf, f.file_size);
            put_length_prefixed_slice(buf, f.smallest.as_ref());
            put_length_prefixed_slice(buf, f.largest.as_ref());
        }
    }

    pub fn decode_from(&mut self, src: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < src.len() {
            let tag = get_var_uint32(src, &mut offset).ok_or(Error::VarDecode("edit tag"))?;
            match tag {
                t if t == Tag::Comparator as u32 => {
                    let name = get_length_prefixed_slice(src, &mut offset)
                        .ok_or(Error::VarDecode("comparator name"))?;
                    self.comparator_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::VarDecode("comparator name"))?,
                    );
                }
                t if t == Tag::LogNumber as u32 => {
                    self.log_number = Some(
                        get_var_uint64(src, &mut offset).ok_or(Error::VarDecode("log number"))?,
                    );
                }
                t if t == Tag::NextFileNumber as u32 => {
                    self.next_file_number = Some(
                        get_var_uint64(src, &mut offset)
                            .ok_or(Error::VarDecode("next file number"))?,
                    );
                }
                t if t == Tag::LastSequence as u32 => {
                    self.last_sequence = Some(
                        get_var_uint64(src, &mut offset)
                            .ok_or(Error::VarDecode("last sequence"))?,
                    );
                }
                t if t == Tag::CompactPointer as u32 => {
                    let level =
                        get_var_uint32(src, &mut offset).ok_or(Error::VarDecode("compact pointer"))?;
                    let key = get_length_prefixed_slice(src, &mut offset)
                        .ok_or(Error::VarDecode("compact pointer"))?;
                    self.compact_pointers.push((level, key.to_vec()));
                }
                t if t == Tag::DeletedFile as u32 => {
                    let level =
                        get_var_uint32(src, &mut offset).ok_or(Error::VarDecode("deleted file"))?;
                    let number =
                        get_var_uint64(src, &mut offset).ok_or(Error::VarDecode("deleted file"))?;
                    self.deleted_files.push((level, number));
                }
                t if t == Tag::NewFile as u32 => {
                    let level =
                        get_var_uint32(src, &mut offset).ok_or(Error::VarDecode("new file"))?;
                    let number =
                        get_var_uint64(src, &mut offset).ok_or(Error::VarDecode("new file"))?;
                    let file_size =
                        get_var_uint64(src, &mut offset).ok_or(Error::VarDecode("new file"))?;
                    let smallest = get_length_prefixed_slice(src, &mut offset)
                        .ok_or(Error::VarDecode("new file"))?;
                    let largest = get_length_prefixed_slice(src, &mut offset)
                        .ok_or(Error::VarDecode("new file"))?;
                    let mut f =
                        FileMetaData::new(number, level, smallest.to_vec(), largest.to_vec());
                    f.file_size = file_size;
                    self.new_files.push(f);
                }
                _ => {
                    return Err(Error::VarDecode("unknown tag, manifest may be corrupted"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_encode_decode_identity() {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name("leveldb.BytewiseComparator");
        edit.set_log_number(15);
        edit.set_next_file(33);
        edit.set_last_sequence(9001);
        edit.set_compact_pointer(2, b"pointer-key");
        edit.delete_file(1, 8);
        for i in 0..5u64 {
            let mut smallest = b"abcd".to_vec();
            let mut largest = b"abcd".to_vec();
            smallest.extend_from_slice(&(i * 2).to_le_bytes());
            largest.extend_from_slice(&(i * 2 + 1).to_le_bytes());
            edit.add_file(0, i + 1, 1024 * (i + 1), &smallest, &largest);
        }

        let mut record = vec![];
        edit.encode_to(&mut record);
        let mut decoded = VersionEdit::default();
        decoded.decode_from(&record).unwrap();
        assert_eq!(edit, decoded);
    }

    #[test]
    fn test_empty_edit_roundtrip() {
        let edit = VersionEdit::default();
        let mut record = vec![];
        edit.encode_to(&mut record);
        assert!(record.is_empty());
        let mut decoded = VersionEdit::default();
        decoded.decode_from(&record).unwrap();
        assert_eq!(edit, decoded);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut record = vec![];
        put_var_uint32(&mut record, 99);
        let mut decoded = VersionEdit::default();
        assert!(decoded.decode_from(&record).is_err());
    }
}
