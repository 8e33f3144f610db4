//! Synthetic workload driver printing component reports
//!
//! Runs a short multi-stream-style workload against every component and
//! prints their reports, useful for eyeballing pool behavior and tuning
//! configs.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use mediapool::{
    FrameSpec, ManagerConfig, MemoryManager, PixelFormat, Scenario, SizeCategory, Strategy,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // An optional JSON config file overrides the multi-stream preset.
    let mut config = match std::env::args().nth(1) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(&path)?)?,
        None => ManagerConfig::for_scenario(Scenario::MultiStream, Strategy::Balanced),
    };
    config.enable_auto_optimization = false;
    let manager = MemoryManager::new(config)?;

    info!("running synthetic workload");

    // Mixed-size tracked allocations, most returned, a few leaked on
    // purpose so the tracker has something to show.
    let mut leaked = Vec::new();
    for i in 0..500usize {
        let size = match i % 4 {
            0 => 512,
            1 => 8 * 1024,
            2 => 48 * 1024,
            _ => 300 * 1024,
        };
        let site = ["demuxer", "video-decoder", "audio-decoder", "filter"][i % 4];
        let block = manager.allocate_for(size, site)?;
        if i % 100 == 99 {
            leaked.push(block);
        } else {
            manager.deallocate(block);
        }
    }

    // Packet churn across categories.
    manager
        .packets()
        .warmup_category(SizeCategory::Medium, 8);
    for i in 0..300usize {
        let lease = manager.packets().allocate(1 + (i * 7919) % 900_000)?;
        if i % 3 == 0 {
            let shared = lease.share();
            let _clone = shared.clone();
        }
    }

    // Two decode streams worth of frames.
    let hd = FrameSpec::new(1920, 1080, PixelFormat::Yuv420p);
    let sd = FrameSpec::new(640, 360, PixelFormat::Nv12);
    manager.frames().preallocate(&hd, 4)?;
    for _ in 0..50 {
        let _hd_frame = manager.frames().allocate(&hd)?;
        let _sd_frame = manager.frames().allocate(&sd)?;
    }

    // Cache traffic with a skewed key distribution.
    for i in 0..400usize {
        let key = format!("gop-{}", i % 40);
        if manager.cache().get(&key).is_none() {
            manager.cache().put(key, vec![0u8; 1024], 1024);
        }
    }
    manager.cache().run_maintenance();

    std::thread::sleep(Duration::from_millis(50));
    let leaks = manager.tracker().detect_leaks(Duration::from_millis(10));
    info!(leaks = leaks.len(), "workload finished");

    println!("{}", manager.report());

    for block in leaked {
        manager.deallocate(block);
    }
    manager.shutdown();
    Ok(())
}
