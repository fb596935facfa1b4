use crate::common::{Error, Result};
use std::path::PathBuf;

const TABLE_FILE_EXT: &str = "ldb";
const LOG_FILE_EXT: &str = "log";
const TEMP_FILE_EXT: &str = "dbtmp";

#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum DbFileType {
    LogFile,
    TableFile,
    DescriptorFile,
    CurrentFile,
    LockFile,
    InfoLogFile,
    TempFile,
}

pub fn make_file_name(path: &str, number: u64, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}/{:06}.{}", path, number, suffix))
}

pub fn make_table_file_name(path: &str, number: u64) -> PathBuf {
    make_file_name(path, number, TABLE_FILE_EXT)
}

pub fn make_log_file(path: &str, number: u64) -> PathBuf {
    make_file_name(path, number, LOG_FILE_EXT)
}

pub fn make_temp_file(path: &str, number: u64) -> PathBuf {
    make_file_name(path, number, TEMP_FILE_EXT)
}

pub fn make_descriptor_file_name(path: &str, number: u64) -> PathBuf {
    PathBuf::from(format!("{}/MANIFEST-{:06}", path, number))
}

pub fn make_current_file(path: &str) -> PathBuf {
    PathBuf::from(format!("{}/CURRENT", path))
}

pub fn make_lock_file(path: &str) -> PathBuf {
    PathBuf::from(format!("{}/LOCK", path))
}

pub fn make_info_log_file(path: &str) -> PathBuf {
    PathBuf::from(format!("{}/LOG", path))
}

pub fn make_old_info_log_file(path: &str) -> PathBuf {
    PathBuf::from(format!("{}/LOG.old", path))
}

/// Classifies a bare file name from the database directory.
pub fn parse_file_name(fname: &str) -> Result<(DbFileType, u64)> {
    if fname == "CURRENT" {
        return Ok((DbFileType::CurrentFile, 0));
    }
    if fname == "LOCK" {
        return Ok((DbFileType::LockFile, 0));
    }
    if fname == "LOG" || fname == "LOG.old" {
        return Ok((DbFileType::InfoLogFile, 0));
    }
    if let Some(rest) = fname.strip_prefix("MANIFEST-") {
        let number = rest
            .parse::<u64>()
            .map_err(|_| Error::InvalidFile(format!("bad manifest name: {}", fname)))?;
        return Ok((DbFileType::DescriptorFile, number));
    }
    let (num, ext) = fname
        .split_once('.')
        .ok_or_else(|| Error::InvalidFile(format!("unrecognized file: {}", fname)))?;
    let number = num
        .parse::<u64>()
        .map_err(|_| Error::InvalidFile(format!("bad file number: {}", fname)))?;
    match ext {
        TABLE_FILE_EXT => Ok((DbFileType::TableFile, number)),
        LOG_FILE_EXT => Ok((DbFileType::LogFile, number)),
        TEMP_FILE_EXT => Ok((DbFileType::TempFile, number)),
        _ => Err(Error::InvalidFile(format!("unrecognized file: {}", fname))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("000007.ldb").unwrap(),
            (DbFileType::TableFile, 7)
        );
        assert_eq!(
            parse_file_name("000123.log").unwrap(),
            (DbFileType::LogFile, 123)
        );
        assert_eq!(
            parse_file_name("MANIFEST-000002").unwrap(),
            (DbFileType::DescriptorFile, 2)
        );
        assert_eq!(
            parse_file_name("CURRENT").unwrap(),
            (DbFileType::CurrentFile, 0)
        );
        assert_eq!(parse_file_name("LOCK").unwrap(), (DbFileType::LockFile, 0));
        assert!(parse_file_name("whatever.txt").is_err());
        assert!(parse_file_name("MANIFEST-x").is_err());
    }

    #[test]
    fn test_file_names_roundtrip() {
        let name = make_table_file_name("/db", 42);
        let fname = name.file_name().unwrap().to_str().unwrap();
        assert_eq!(
            parse_file_name(fname).unwrap(),
            (DbFileType::TableFile, 42)
        );
        let name = make_log_file("/db", 9);
        let fname = name.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_file_name(fname).unwrap(), (DbFileType::LogFile, 9));
    }
}
