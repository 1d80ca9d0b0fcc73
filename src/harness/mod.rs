pub mod allocator;
pub mod backend;
pub mod config;
pub mod introspection;
pub mod memory;
pub mod port;
pub mod suite;

pub use allocator::VerbsAllocator;
pub use backend::ConnectionBackend;
pub use config::HarnessConfig;
pub use memory::MemoryBlock;
pub use port::PortGid;
pub use suite::VerbsHelperSuite;
