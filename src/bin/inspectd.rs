//! inspectd - golden-sample inspection daemon
//!
//! This daemon:
//! 1. Loads its configuration (file named by INSPECT_CONFIG, then INSPECT_* overrides)
//! 2. Activates a reference profile (profile record, or the source's golden sample)
//! 3. Starts the inspection pipeline on explicit compute lanes
//! 4. Feeds frames from the configured source at the target frame rate
//! 5. Logs confirmed defects, alignment failures and periodic health metrics

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use inspection_kernel::{
    DetectionResult, FrameStatus, InspectdConfig, InspectionParams, Pipeline, ProfileRecord,
    ReferenceProfile, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(name = "inspectd", about = "Golden-sample defect inspection daemon")]
struct Args {
    /// Config file (.toml, otherwise JSON)
    #[arg(long, env = "INSPECT_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stop after submitting this many frames
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Print every result as a JSON line on stdout
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = InspectdConfig::load_from(args.config.as_deref())?;
    log::info!("{}", inspection_kernel::version());

    let mut source = SyntheticSource::new(cfg.synthetic_config())?;
    source.connect()?;

    let profile = match &cfg.profile.record_path {
        Some(path) => {
            log::info!("loading profile record {}", path.display());
            ProfileRecord::load(path)?.into_profile(&cfg.pipeline)?
        }
        None => ReferenceProfile::new(
            cfg.profile.product_id.clone(),
            source.reference_image().clone(),
            InspectionParams::from_config(&cfg.pipeline),
            &cfg.pipeline.alignment,
        )?,
    };

    let lanes = cfg.pipeline.lanes()?;
    let (pipeline, results) = Pipeline::start(cfg.pipeline.clone(), profile, lanes)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    let json = args.json;
    let printer = std::thread::Builder::new()
        .name("inspectd-results".to_string())
        .spawn(move || {
            for result in results {
                report(&result, json);
            }
        })?;

    let interval = cfg.pipeline.frame_interval();
    let mut submitted = 0u64;
    let mut last_health_log = Instant::now();
    log::info!("inspectd running; Ctrl-C to stop");

    while running.load(Ordering::SeqCst) {
        if args.frames.is_some_and(|limit| submitted >= limit) {
            break;
        }
        let tick = Instant::now();
        let frame = source.next_frame();
        match pipeline.submit(&frame) {
            Ok(_) => submitted += 1,
            Err(e) => log::warn!("frame rejected: {}", e),
        }

        if last_health_log.elapsed() >= cfg.health_log_interval {
            let m = pipeline.metrics();
            let stats = source.stats();
            log::info!(
                "source health={} frames={} url={} | delivered={} dropped={} alignment_failures={} avg_latency_ms={:.2} ring={}/{} generation={}",
                source.is_healthy(),
                stats.frames_generated,
                stats.url,
                m.frames_delivered,
                m.dropped_frame_count,
                m.alignment_failure_count,
                m.average_latency_ms,
                m.ring_occupancy,
                pipeline.config().ring_buffer_capacity,
                m.profile_generation
            );
            last_health_log = Instant::now();
        }

        if let Some(rest) = interval.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    log::info!("shutting down after {} frames", submitted);
    let metrics = pipeline.shutdown();
    if printer.join().is_err() {
        log::warn!("result printer panicked");
    }
    if json {
        println!("{}", serde_json::to_string(&metrics)?);
    }
    Ok(())
}

fn report(result: &DetectionResult, json: bool) {
    if json {
        match serde_json::to_string(result) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("failed to encode result {}: {}", result.frame_id, e),
        }
    }
    match result.status {
        FrameStatus::Ok => {
            for defect in &result.defects {
                log::info!(
                    "frame {}: defect #{} at ({}, {}) {}x{} area={} conf={:.2} since frame {}",
                    result.frame_id,
                    defect.id,
                    defect.bbox.x,
                    defect.bbox.y,
                    defect.bbox.width,
                    defect.bbox.height,
                    defect.area,
                    defect.confidence,
                    defect.first_seen_frame
                );
            }
        }
        FrameStatus::AlignmentFailed => {
            let reason = result
                .alignment_failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default();
            log::warn!("frame {}: alignment failed: {}", result.frame_id, reason);
        }
        FrameStatus::Dropped => {
            log::debug!(
                "frame {}: dropped ({:?})",
                result.frame_id,
                result.drop_reason
            );
        }
    }
}
