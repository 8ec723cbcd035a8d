use std::fmt;

use thiserror::Error;

/// Kind of identifier rejected by an `InvalidIdentity` error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Process,
    Region,
    Vma,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Identity::Process => "process",
            Identity::Region => "region",
            Identity::Vma => "vma",
        };
        f.write_str(name)
    }
}

/// Errors produced by the memory simulator.
#[derive(Debug, Error)]
pub enum Error {
    /// A process, region or VMA id outside the configured bounds.
    #[error("invalid {kind} id {id}")]
    InvalidIdentity { kind: Identity, id: usize },
    /// The swap device a process points at does not exist.
    #[error("swap device {0} is not available")]
    DeviceUnavailable(usize),
    /// No free frame or swap slot, and nothing left to evict.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// Offset past the end of an allocated region.
    #[error("region {region} spans [{start}, {end}) but offset {offset} was requested")]
    OutOfBounds {
        region: usize,
        start: usize,
        end: usize,
        offset: usize,
    },
    /// Extending a VMA would run into another VMA of the same process.
    #[error("vma {vma} extension [{start}, {end}) overlaps vma {other}")]
    AllocationOverlap {
        vma: usize,
        start: usize,
        end: usize,
        other: usize,
    },
    #[error("address {addr:#x} outside device capacity {capacity:#x}")]
    BadAddress { addr: usize, capacity: usize },
    #[error("random access at {addr:#x} on a sequential device")]
    UnsupportedAccess { addr: usize },
    #[error("frame {0} is not a used frame of this device")]
    InvalidFrame(usize),
    #[error("page {0} is not mapped")]
    UnmappedPage(usize),
    #[error("invalid allocation size {0}")]
    InvalidSize(usize),
    #[error("region {0} is already allocated")]
    RegionInUse(usize),
    #[error("ready queue is full")]
    QueueFull,
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_message() {
        let err = Error::OutOfBounds {
            region: 3,
            start: 256,
            end: 556,
            offset: 300,
        };
        let msg = err.to_string();
        assert!(msg.contains("region 3"));
        assert!(msg.contains("[256, 556)"));
        assert!(msg.contains("300"));
    }

    #[test]
    fn test_identity_display() {
        let err = Error::InvalidIdentity {
            kind: Identity::Region,
            id: 31,
        };
        assert_eq!(err.to_string(), "invalid region id 31");
    }
}
