//! Paging simulator - Main Entry Point
//!
//! Usage: paging-sim [OPTIONS] <config>
//!
//! Loads the machine description and process workloads from a TOML file,
//! runs every workload round-robin and prints a summary of the run.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use log::{debug, info};

use paging_sim::io::Workload;
use paging_sim::sched::{Dispatcher, RunReport};
use paging_sim::vm_manager::Stats;
use paging_sim::{Error, Pid, Result, SimConfig, VmManager};

/// Demand-paged virtual memory simulator
#[derive(Parser, Debug)]
#[command(name = "paging-sim", version, about)]
struct Cli {
    /// Simulator config (TOML)
    config: PathBuf,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log page tables and RAM contents after every access
    #[arg(long)]
    dump: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = SimConfig::from_file(&cli.config)?;
    config.dump |= cli.dump;
    info!("loaded {}", cli.config.display());

    let mut vm = VmManager::from_config(&config)?;
    let mut dispatcher = Dispatcher::new(config.time_slice);

    for (idx, process) in config.processes.iter().enumerate() {
        let pid = Pid(idx as u32);
        let workload = load_workload(&process.workload)?;
        vm.spawn(pid, config.swap_for(process))?;
        debug!("pid {}: {} instructions", pid, workload.len());
        dispatcher.admit(pid, workload);
    }

    let report = dispatcher.run(&mut vm)?;
    print_summary(&report, &vm.stats());
    Ok(())
}

fn load_workload(path: &Path) -> Result<Workload> {
    Workload::from_file(path).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
}

fn print_summary(report: &RunReport, stats: &Stats) {
    println!("=== Summary ===");
    println!("Processes finished:   {}", report.finished);
    println!("Instructions:         {}", report.executed);
    println!("Failed instructions:  {}", report.failed);
    println!("Page faults:          {}", stats.page_faults);
    println!("Evictions:            {}", stats.evictions);
    println!("Reclaims:             {}", stats.reclaims);
    println!("TLB hits:             {}", stats.tlb_hits);
    println!("TLB misses:           {}", stats.tlb_misses);
}
