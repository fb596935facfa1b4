use crate::common::{Result, WritableFile};

pub struct WritableFileWriter {
    file_name: String,
    writable_file: Box<dyn WritableFile>,
    file_size: usize,
    pad_buf: Vec<u8>,
}

impl WritableFileWriter {
    pub fn new(writable_file: Box<dyn WritableFile>, file_name: String) -> Self {
        WritableFileWriter {
            file_name,
            writable_file,
            file_size: 0,
            pad_buf: vec![],
        }
    }

    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writable_file.append(data).await?;
        self.file_size += data.len();
        Ok(())
    }

    pub async fn pad(&mut self, pad_bytes: usize) -> Result<()> {
        self.pad_buf.clear();
        self.pad_buf.resize(pad_bytes, 0);
        self.writable_file.append(&self.pad_buf).await?;
        self.file_size += pad_bytes;
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<()> {
        self.writable_file.sync().await
    }

    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        self.writable_file.truncate(offset)?;
        self.file_size = offset as usize;
        Ok(())
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn name(&self) -> &str {
        &self.file_name
    }
}
