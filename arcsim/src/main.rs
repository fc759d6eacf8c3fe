use arcsim::{CounterId, Engine, RunExit, SimOptions};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

/// Instruction-set simulator for a 32-bit RISC guest, combining
/// interpretation with dynamic binary translation.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// ELF32 executable to simulate
    #[arg(long, conflicts_with_all = ["hex", "image"])]
    elf: Option<PathBuf>,

    /// Intel-HEX image to simulate
    #[arg(long, conflicts_with = "image")]
    hex: Option<PathBuf>,

    /// Raw binary image to simulate
    #[arg(long)]
    image: Option<PathBuf>,

    /// Load address (and entry point) for a raw binary image
    #[arg(long, default_value = "0x0", value_parser = parse_addr)]
    base: u32,

    /// Override the entry point
    #[arg(long, value_parser = parse_addr)]
    entry: Option<u32>,

    /// Disable dynamic binary translation (interpret everything)
    #[arg(long)]
    interp_only: bool,

    /// Enable the cycle-accurate pipeline model
    #[arg(long)]
    cycle_accurate: bool,

    /// Emit a per-instruction trace (requires RUST_LOG=trace)
    #[arg(long)]
    trace: bool,

    /// Extra consistency checking in the dispatch loop
    #[arg(long)]
    debug_checks: bool,

    /// Deliver traps to the guest instead of emulating them
    #[arg(long)]
    no_emulate_traps: bool,

    /// Number of translation worker threads
    #[arg(long, default_value = "2")]
    workers: usize,

    /// Block execution count that qualifies a block for translation
    #[arg(long, default_value = "4096")]
    hot_threshold: u64,

    /// Hot blocks per page before a translation unit is formed
    #[arg(long, default_value = "4")]
    page_threshold: u32,
}

fn parse_addr(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| format!("invalid address: {text}"))
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut opts = SimOptions {
        fast: !args.interp_only,
        cycle_accurate: args.cycle_accurate,
        trace: args.trace,
        debug: args.debug_checks,
        emulate_traps: !args.no_emulate_traps,
        workers: args.workers,
        hot_threshold: args.hot_threshold,
        page_translate_threshold: args.page_threshold,
        ..SimOptions::default()
    };
    if opts.cycle_accurate {
        // native traces bypass the pipeline model
        opts.fast = false;
    }

    let mut engine = match Engine::new(opts) {
        Ok(engine) => engine,
        Err(error) => {
            error!("configuration rejected: {error}");
            std::process::exit(-1);
        }
    };

    let loaded = if let Some(path) = &args.elf {
        engine.load_elf_image(path)
    } else if let Some(path) = &args.hex {
        engine.load_hex_image(path)
    } else if let Some(path) = &args.image {
        engine.load_binary_image(path, args.base)
    } else {
        error!("no executable given (use --elf, --hex or --image)");
        std::process::exit(-1);
    };
    if let Err(error) = loaded {
        error!("failed to load guest image: {error}");
        std::process::exit(-2);
    }

    if let Some(entry) = args.entry {
        engine.set_pc(entry);
    }

    info!("starting simulation at {:#010x}", engine.pc());
    loop {
        match engine.run() {
            RunExit::Paused => continue,
            RunExit::Halted | RunExit::Stopped => break,
            RunExit::Fatal => {
                error!("simulation stopped by a fatal host condition");
                std::process::exit(-3);
            }
        }
    }

    let interpreted = engine.counter(CounterId::InterpretedInstructionCount64);
    let native = engine.counter(CounterId::NativeInstructionCount64);
    let cycles = engine.counter(CounterId::CycleCount64);
    println!("interpreted instructions: {interpreted}");
    println!("native instructions:      {native}");
    println!("total instructions:       {}", interpreted + native);
    if args.cycle_accurate {
        println!("cycles:                   {cycles}");
    }
}
