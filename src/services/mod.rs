pub mod fs_store;
pub mod history;
pub mod memory_store;

pub use fs_store::FsMediaStore;
pub use memory_store::MemoryMediaStore;
