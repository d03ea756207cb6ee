//! Storage module
//!
//! Piece-to-file mapping, disk worker pool, write buffering and resume data.

pub mod disk;
pub mod file;
pub mod piece;
pub mod resume;

pub use disk::{DiskEvent, DiskJob, DiskPool, DiskWriter};
pub use file::{AllocPolicy, FileStat, FileStorage, LockingPolicy, UNWANTED_DIR};
pub use piece::{block_count, block_length, BufferedWrite, ReadCache, WriteBuffer, BLOCK_SIZE};
pub use resume::{startup_check, EngineResumeData, PieceState, StartupCheck, RESUME_FORMAT};
