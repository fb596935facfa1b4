mod reader;
mod writer;

pub const HEADER_SIZE: usize = 4 + 2 + 1;

pub const BLOCK_SIZE: usize = 32768;

#[repr(u8)]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum RecordType {
    // Zero is reserved for zero-padded block tails.
    ZeroType = 0,
    FullType = 1,

    // For records spanning block boundaries
    FirstType = 2,
    MiddleType = 3,
    LastType = 4,
}

pub const MAX_RECORD_TYPE: u8 = RecordType::LastType as u8;

pub use reader::LogReader;
pub use writer::LogWriter;
