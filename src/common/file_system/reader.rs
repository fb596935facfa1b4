use crate::common::{RandomAccessFile, Result, SequentialFile};

pub struct RandomAccessFileReader {
    file: Box<dyn RandomAccessFile>,
    filename: String,
}

impl RandomAccessFileReader {
    pub fn new(file: Box<dyn RandomAccessFile>, filename: String) -> Self {
        Self { file, filename }
    }

    pub async fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.file.read(offset, buf).await
    }

    pub fn name(&self) -> &str {
        self.filename.as_str()
    }

    pub fn file_size(&self) -> usize {
        self.file.file_size()
    }
}

pub struct SequentialFileReader {
    file: Box<dyn SequentialFile>,
    filename: String,
}

impl SequentialFileReader {
    pub fn new(file: Box<dyn SequentialFile>, filename: String) -> Self {
        Self { file, filename }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.read_sequential(buf).await
    }

    pub fn name(&self) -> &str {
        self.filename.as_str()
    }

    pub fn file_size(&self) -> usize {
        self.file.get_file_size()
    }
}
