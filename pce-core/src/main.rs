use clap::Parser;
use pce_core::config::{DEFAULT_CPU_FREQUENCY, SystemConfig};
use pce_core::cpu::CpuBackendKind;
use pce_core::devices::BochsVgaConfig;
use pce_core::host::{HostInterface, SimulationStats};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// System RAM in MiB
    #[arg(long, default_value_t = 16)]
    memory_mib: u32,

    /// Emulated CPU clock in Hz
    #[arg(long, default_value_t = DEFAULT_CPU_FREQUENCY)]
    frequency: f32,

    /// CPU backend (interpreter, cached-interpreter, recompiler)
    #[arg(long, default_value = "interpreter")]
    backend: CpuBackendKind,

    /// Run as fast as possible instead of at the emulated clock rate
    #[arg(long)]
    no_speed_limit: bool,

    /// Run without the Bochs VBE display adapter
    #[arg(long)]
    no_vga: bool,

    /// Optional VGA option ROM image (at most 64 KiB)
    #[arg(long)]
    vga_bios: Option<PathBuf>,

    /// Video memory in MiB
    #[arg(long, default_value_t = 16)]
    vram_mib: u32,

    /// Seconds to run before stopping
    #[arg(long, default_value_t = 5.0)]
    run_seconds: f64,

    /// Restore this state file after creating the system
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a state file before stopping
    #[arg(long)]
    save_state: Option<PathBuf>,
}

fn print_section(title: &str) {
    println!("\n\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
    println!("\x1b[1;33m  ▸ {}\x1b[0m", title);
    println!("\x1b[1;36m━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\x1b[0m");
}

fn print_status(component: &str, status: &str, ok: bool) {
    let status_color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };
    let check = if ok { "✓" } else { "✗" };
    println!("    \x1b[0;37m{:<40}\x1b[0m {}[{}] {}\x1b[0m", component, status_color, check, status);
}

fn print_info(key: &str, value: &str) {
    println!("    \x1b[0;90m├─\x1b[0m \x1b[0;37m{:<20}\x1b[0m \x1b[1;97m{}\x1b[0m", key, value);
}

fn print_stats(stats: &SimulationStats) {
    print_info("Simulated", &format!("{:.3} s", stats.total_time_simulated as f64 / 1e9));
    print_info("Speed", &format!("{:.1}%", stats.simulation_speed));
    print_info("Host CPU", &format!("{:.1}%", stats.host_cpu_usage));
    print_info("Lost time", &format!("{:.1} ms", stats.lost_time.as_secs_f64() * 1000.0));
    print_info("Cycles", &stats.cpu_stats.cycles_executed.to_string());
    print_info("Instructions", &stats.cpu_stats.instructions().to_string());
    print_info("Cached blocks", &stats.cpu_stats.code_cache_blocks_executed.to_string());
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let memory_size = args
        .memory_mib
        .checked_mul(1024 * 1024)
        .ok_or("Requested memory size is too large")?;
    let vram_size = args
        .vram_mib
        .checked_mul(1024 * 1024)
        .ok_or("Requested video memory size is too large")?;

    let config = SystemConfig {
        memory_size,
        cpu_frequency: args.frequency,
        cpu_backend: args.backend,
        speed_limiter: !args.no_speed_limit,
        vga: (!args.no_vga).then(|| BochsVgaConfig {
            bios_image: args.vga_bios.clone(),
            vram_size,
            ..BochsVgaConfig::default()
        }),
        cpu_factory: None,
    };

    // ─── SYSTEM ───────────────────────────────────────────────────────────────
    print_section("SYSTEM");
    print_info("Memory", &format!("{} MiB", args.memory_mib));
    print_info("CPU clock", &format!("{:.3} MHz", args.frequency / 1_000_000.0));
    print_info("CPU backend", &args.backend.to_string());
    print_info("Speed limiter", if args.no_speed_limit { "off" } else { "on" });
    if let Some(vga) = &config.vga {
        print_info("Video memory", &format!("{} MiB", vga.vram_size / (1024 * 1024)));
        print_info("LFB", &format!("0x{:08X}", vga.lfb_address));
    }

    let mut host = HostInterface::default();
    match host.create_system(config) {
        Ok(()) => print_status("Simulation thread", "RUNNING", true),
        Err(e) => {
            print_status("Simulation thread", &e.to_string(), false);
            return Err(e.into());
        }
    }

    if let Some(path) = &args.load_state {
        print_section("STATE");
        match host.load_system_state(path) {
            Ok(()) => print_status(&path.display().to_string(), "LOADED", true),
            Err(e) => {
                print_status(&path.display().to_string(), &e.to_string(), false);
                host.reset_system()?;
            }
        }
    }

    // ─── RUN ──────────────────────────────────────────────────────────────────
    print_section("RUN");
    let run_time = Duration::try_from_secs_f64(args.run_seconds).map_err(|e| format!("--run-seconds: {}", e))?;
    let start = Instant::now();
    std::thread::sleep(run_time);
    print_info("Wall time", &format!("{:.3} s", start.elapsed().as_secs_f64()));
    print_stats(&host.stats());

    if let Some(path) = &args.save_state {
        host.save_system_state(path)?;
        // Events run in order; this returns once the save has been written.
        host.with_machine(|_| ())?;
        print_status(&path.display().to_string(), "SAVED", path.exists());
    }

    host.stop_simulation();
    print_status("Simulation thread", "STOPPED", true);
    Ok(())
}
