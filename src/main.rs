//! Surfmix 诊断工具
//!
//! 不依赖宿主框架，单独驱动整条后端链路：
//! - `info`: 列出工厂能力和逻辑设备
//! - `play`: 向共享表面渲染测试音（可用内置模拟消费者顶替真实对端）

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use surfmix::audio::{AudioFormat, ChannelLayout, SampleFormat, ToneMixer};
use surfmix::backend::{
    BackendFactory, BackendKind, PlaybackBackend, ProbeTarget, SurfaceBackend, SurfaceFactory,
    SURFACE_SAMPLE_RATE,
};
use surfmix::surface::{self, sim::SurfaceSim, SurfaceConnection};

/// Surfmix - shared-surface audio backend diagnostics
#[derive(Parser)]
#[command(name = "surfmix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend capabilities and devices
    Info {
        /// Shared surface name to check (shm object path)
        #[arg(short, long)]
        surface: Option<String>,
    },

    /// Render a test tone into the surface
    Play {
        /// Shared surface name (shm object path, e.g. /my-surface)
        #[arg(short, long)]
        surface: Option<String>,

        /// Use an in-process consumer simulator instead of a real surface
        #[arg(long)]
        sim: bool,

        /// Playback duration in seconds
        #[arg(long, default_value = "5")]
        secs: u64,

        /// Tone frequency in Hz
        #[arg(short, long, default_value = "440.0")]
        freq: f32,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Info { surface } => show_info(surface.as_deref()),
        Commands::Play {
            surface,
            sim,
            secs,
            freq,
        } => play_tone(surface.as_deref(), sim, secs, freq),
    }
}

/// 列出工厂能力和逻辑设备
fn show_info(surface_name: Option<&str>) -> anyhow::Result<()> {
    let factory = SurfaceFactory;

    println!("=== Surface Backend ===\n");
    println!(
        "Playback support: {}",
        factory.query_support(BackendKind::Playback)
    );
    println!(
        "Capture support: {}",
        factory.query_support(BackendKind::Capture)
    );

    println!("\nPlayback devices:");
    for name in factory.probe(ProbeTarget::Playback) {
        println!("  {}", name);
    }
    println!("\nFixed sample rate: {} Hz", SURFACE_SAMPLE_RATE);

    if let Some(name) = surface_name {
        match SurfaceConnection::connect(name) {
            Ok(conn) => {
                let geo = conn.geometry();
                println!("\nSurface {}: reachable", name);
                println!(
                    "  audio capacity {} bytes, negotiated {} bytes (x{}), used {}",
                    geo.capacity, geo.abuf_size, geo.abuf_count, geo.abuf_used
                );
            }
            Err(e) => println!("\nSurface {}: unreachable ({})", name, e),
        }
    }

    Ok(())
}

/// 通过完整后端链路渲染测试音
fn play_tone(surface_name: Option<&str>, use_sim: bool, secs: u64, freq: f32) -> anyhow::Result<()> {
    // 建立 primary 连接：真实表面或内置模拟消费者
    let sim = if use_sim {
        Some(SurfaceSim::create(256 * 1024).context("failed to create surface simulator")?)
    } else {
        None
    };

    let conn = match (&sim, surface_name) {
        (Some(sim), _) => sim
            .client_connection()
            .context("failed to connect to simulator surface")?,
        (None, Some(name)) => {
            SurfaceConnection::connect(name).context("failed to connect to shared surface")?
        }
        (None, None) => bail!("either --surface <NAME> or --sim is required"),
    };
    surface::set_primary(Arc::new(conn));

    let format = AudioFormat::new(
        SURFACE_SAMPLE_RATE,
        ChannelLayout::Stereo,
        SampleFormat::S16,
    );
    let mixer = ToneMixer::new(format, freq, 0.5);
    let mut backend = SurfaceBackend::new(Box::new(mixer));

    backend.open(None)?;
    backend.reset()?;
    backend.start()?;
    log::info!("Playing {} Hz tone for {} s", freq, secs);

    // Ctrl+C 提前停止
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::Release);
        })
        .context("failed to install signal handler")?;
    }

    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline && !interrupted.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }

    backend.stop();
    println!("{}", backend.stats().report());

    if let Some(sim) = &sim {
        println!(
            "Simulator drained {} bytes, {} resize grants, {} flush events",
            sim.drained_bytes(),
            sim.resize_grants(),
            sim.flush_events()
        );
    }

    surface::take_primary();
    Ok(())
}
