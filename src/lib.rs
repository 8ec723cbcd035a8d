pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod memory;
pub mod region;
pub mod sched;
pub mod tlb;
pub mod translation;
pub mod vm_manager;

// Re-export commonly used items for convenience
pub use config::SimConfig;
pub use constants::*;
pub use error::{Error, Result};
pub use memory::{AccessMode, MemPhy};
pub use translation::{Pte, VirtualAddress};
pub use vm_manager::{Pid, VmManager};
