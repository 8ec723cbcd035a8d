//! Simulator configuration loaded from TOML.
//!
//! ```toml
//! ram_size = 1024
//! swap_sizes = [4096]
//! tlb = true
//! time_slice = 2
//!
//! [[process]]
//! workload = "p0.txt"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::memory::{AccessMode, MemPhy};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Workload script, relative to the config file
    pub workload: PathBuf,
    /// Overrides the machine-wide `active_swap` for this process
    #[serde(default)]
    pub swap: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub ram_size: usize,
    pub swap_sizes: Vec<usize>,
    pub active_swap: usize,
    pub ram_mode: AccessMode,
    pub swap_mode: AccessMode,
    pub tlb: bool,
    pub time_slice: usize,
    pub dump: bool,
    #[serde(rename = "process")]
    pub processes: Vec<ProcessConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            ram_size: DEFAULT_RAM_SIZE,
            swap_sizes: vec![DEFAULT_SWAP_SIZE; MAX_SWAP_DEVICES],
            active_swap: 0,
            ram_mode: AccessMode::Random,
            swap_mode: AccessMode::Random,
            tlb: false,
            time_slice: DEFAULT_TIME_SLICE,
            dump: false,
            processes: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Load and validate a config file. Workload paths are resolved against
    /// the directory holding the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        let base = path.parent().unwrap_or(Path::new(""));
        for process in &mut config.processes {
            if process.workload.is_relative() {
                process.workload = base.join(&process.workload);
            }
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: SimConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_size("ram_size", self.ram_size)?;
        if self.swap_sizes.is_empty() || self.swap_sizes.len() > MAX_SWAP_DEVICES {
            return Err(Error::Config(format!(
                "expected 1 to {} swap devices, got {}",
                MAX_SWAP_DEVICES,
                self.swap_sizes.len()
            )));
        }
        for &size in &self.swap_sizes {
            check_size("swap_sizes", size)?;
        }
        self.check_swap_index(self.active_swap)?;
        if self.time_slice == 0 {
            return Err(Error::Config("time_slice must be positive".into()));
        }
        for process in &self.processes {
            if let Some(idx) = process.swap {
                self.check_swap_index(idx)?;
            }
        }
        Ok(())
    }

    fn check_swap_index(&self, idx: usize) -> Result<()> {
        if idx >= self.swap_sizes.len() {
            return Err(Error::Config(format!(
                "swap device {} not configured ({} available)",
                idx,
                self.swap_sizes.len()
            )));
        }
        Ok(())
    }

    /// Swap device index used by `process`
    pub fn swap_for(&self, process: &ProcessConfig) -> usize {
        process.swap.unwrap_or(self.active_swap)
    }

    /// Create the RAM device and every swap device, formatted and empty
    pub fn build_devices(&self) -> Result<(MemPhy, Vec<MemPhy>)> {
        let ram = MemPhy::new(self.ram_size, self.ram_mode)?;
        let swaps = self
            .swap_sizes
            .iter()
            .map(|&size| MemPhy::new(size, self.swap_mode))
            .collect::<Result<Vec<_>>>()?;
        Ok((ram, swaps))
    }
}

fn check_size(name: &str, size: usize) -> Result<()> {
    if size == 0 || size % PAGE_SIZE != 0 {
        return Err(Error::Config(format!(
            "{} must be a non-zero multiple of {}, got {}",
            name, PAGE_SIZE, size
        )));
    }
    Ok(())
}
