//! profile_check - validate a reference profile record before deployment
//!
//! Loads a profile record, decodes its reference image, extracts keypoints
//! with the configured detector and checks it against the configured frame
//! size. Prints the profile fingerprint the pipeline will stamp on results.

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;

use inspection_kernel::align::uses_fixture_mode;
use inspection_kernel::{InspectdConfig, ProfileRecord};

#[derive(Parser, Debug)]
#[command(
    name = "profile_check",
    about = "Validate a reference profile record against the inspection config"
)]
struct Args {
    /// Profile record (.toml, otherwise JSON)
    #[arg(long, value_name = "PATH")]
    profile: PathBuf,

    /// Inspection config file (.toml, otherwise JSON)
    #[arg(long, env = "INSPECT_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit a JSON report instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    product_id: String,
    width: u32,
    height: u32,
    keypoints: usize,
    fixture_alignment: bool,
    threshold: inspection_kernel::ThresholdMode,
    morph_kernel_radius: usize,
    morph_iterations: usize,
    fingerprint: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let cfg = InspectdConfig::load_from(args.config.as_deref())?;
    let pipeline = &cfg.pipeline;

    let profile = ProfileRecord::load(&args.profile)?.into_profile(pipeline)?;
    profile.validate_for(pipeline.frame_width, pipeline.frame_height)?;

    let params = profile.params();
    let report = Report {
        product_id: profile.product_id().to_string(),
        width: profile.image().width(),
        height: profile.image().height(),
        keypoints: profile.keypoints().len(),
        fixture_alignment: uses_fixture_mode(profile.keypoints().len(), &pipeline.alignment),
        threshold: params.threshold,
        morph_kernel_radius: params.morph_kernel_radius,
        morph_iterations: params.morph_iterations,
        fingerprint: profile.fingerprint_hex(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("profile_check: {}", args.profile.display());
    println!("  product_id:   {}", report.product_id);
    println!("  reference:    {}x{}", report.width, report.height);
    println!(
        "  keypoints:    {}{}",
        report.keypoints,
        if report.fixture_alignment {
            " (below min_matches: frames align by fixture)"
        } else {
            ""
        }
    );
    println!("  threshold:    {:?}", report.threshold);
    println!(
        "  morphology:   radius {} x {} iterations",
        report.morph_kernel_radius, report.morph_iterations
    );
    println!("  fingerprint:  {}", report.fingerprint);
    println!("OK");
    Ok(())
}
