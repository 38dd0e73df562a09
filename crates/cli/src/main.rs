//! Out-of-order pipeline simulator CLI.
//!
//! Loads a raw little-endian program image at address zero, runs the
//! out-of-order core until the program exits or a cycle limit is reached,
//! and prints the statistics table.

use clap::Parser;
use std::fs;
use std::process;

use ooo_core::branch::BimodalPredictor;
use ooo_core::config::Config;
use ooo_core::core::{Core, CoreStatus, CpuContext};
use ooo_core::isa::rv64::Rv64Architecture;
use ooo_core::isa::Architecture;
use ooo_core::memory::{FixedLatencyMemory, IdentityPageTable};

/// Memory backing the simulated program.
const MEMORY_SIZE: usize = 4 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "ooosim",
    author,
    version,
    about = "Cycle-accurate out-of-order pipeline simulator",
    long_about = "Run a raw RV64 program image through the out-of-order core.\n\n\
                  The image is loaded at address 0 and executed until an exit \
                  syscall, a fatal fault, or the cycle limit."
)]
struct Cli {
    /// Raw program image to execute.
    #[arg(short, long)]
    file: String,

    /// JSON configuration file (defaults apply when omitted).
    #[arg(short, long)]
    config: Option<String>,

    /// Maximum cycles to simulate.
    #[arg(long, default_value_t = 10_000_000)]
    max_cycles: u64,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("error: {}", message);
            process::exit(1);
        }
    };

    let image = fs::read(&cli.file).unwrap_or_else(|e| {
        eprintln!("error: reading {}: {}", cli.file, e);
        process::exit(1);
    });
    if image.len() > MEMORY_SIZE {
        eprintln!("error: image larger than simulated memory");
        process::exit(1);
    }

    let mut memory = FixedLatencyMemory::new(MEMORY_SIZE, config.memory_hierarchy.access_latency);
    memory.load_image(0, &image);

    let arch = Rv64Architecture::new(&config);
    let arch_counts = arch.architectural_register_counts();
    let mut core = Core::new(
        &config,
        Box::new(arch),
        Box::new(BimodalPredictor::new(256)),
        Box::new(memory),
        Box::new(IdentityPageTable::new(MEMORY_SIZE as u64)),
    )
    .unwrap_or_else(|e| {
        eprintln!("error: {}", e);
        process::exit(1);
    });

    core.schedule(CpuContext {
        tid: 1,
        pc: 0,
        program_byte_length: image.len() as u64,
        register_file: arch_counts
            .iter()
            .map(|&count| vec![Default::default(); count as usize])
            .collect(),
    });

    while core.ticks() < cli.max_cycles {
        core.tick();
        if core.status() == CoreStatus::Halted {
            break;
        }
    }

    ooo_core::stats::print(&core.stats());

    match core.exit_code() {
        Some(code) => process::exit(code as i32),
        None if core.status() == CoreStatus::Halted => process::exit(1),
        None => {
            eprintln!("cycle limit reached");
            process::exit(2);
        }
    }
}

/// Loads and validates the configuration file, or returns defaults.
fn load_config(path: Option<&str>) -> Result<Config, String> {
    let config = match path {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("reading {}: {}", path, e))?;
            Config::from_json(&text).map_err(|e| e.to_string())?
        }
        None => Config::default(),
    };
    Ok(config.with_default_units())
}
