// # Device Config Stores
//
// Implementations of the ConfigStore trait for the device agent.

pub mod file;
pub mod memory;

pub use file::FileConfigStore;
pub use memory::MemoryConfigStore;
