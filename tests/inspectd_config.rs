use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use inspection_kernel::config::InspectdConfig;
use inspection_kernel::ingest::SceneKind;
use inspection_kernel::ThresholdMode;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "INSPECT_CONFIG",
        "INSPECT_TARGET_FPS",
        "INSPECT_DIFF_THRESHOLD",
        "INSPECT_ADAPTIVE_THRESHOLD",
        "INSPECT_MIN_DEFECT_AREA",
        "INSPECT_SOURCE_URL",
        "INSPECT_PROFILE_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "pipeline": {
            "target_fps": 25,
            "max_in_flight_frames": 3,
            "ring_buffer_capacity": 6,
            "threshold": { "mode": "fixed", "cutoff": 30.0 },
            "morph_kernel_radius": 2,
            "alignment_max_reprojection_error": 1.5,
            "frame_width": 320,
            "frame_height": 240,
            "alignment": { "min_matches": 20 }
        },
        "source": {
            "url": "stub://conveyor",
            "scene": "uniform",
            "level": 90,
            "defect": { "x": 40, "y": 50, "width": 10, "height": 10, "delta": 70 }
        },
        "profile": { "product_id": "bracket-a" },
        "health_log_secs": 3
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("INSPECT_CONFIG", file.path());
    std::env::set_var("INSPECT_MIN_DEFECT_AREA", "9");
    std::env::set_var("INSPECT_ADAPTIVE_THRESHOLD", "true");
    std::env::set_var("INSPECT_PROFILE_PATH", "/srv/profiles/bracket-a.toml");

    let cfg = InspectdConfig::load().expect("load config");

    let p = &cfg.pipeline;
    assert_eq!(p.target_fps, 25);
    assert_eq!(p.max_in_flight_frames, 3);
    assert_eq!(p.ring_buffer_capacity, 6);
    assert_eq!(p.threshold, ThresholdMode::Adaptive { min_cutoff: 30.0 });
    assert_eq!(p.min_defect_area, 9);
    assert_eq!(p.morph_kernel_radius, 2);
    assert_eq!(p.alignment_max_reprojection_error(), 1.5);
    assert_eq!(p.alignment.min_matches, 20);
    assert_eq!(p.alignment.ransac_iterations, 500);
    assert_eq!((p.frame_width, p.frame_height), (320, 240));
    assert_eq!(p.confirm_frame_count, 3);

    assert_eq!(cfg.source.url, "stub://conveyor");
    assert_eq!(cfg.source.scene, SceneKind::Uniform { level: 90 });
    let defect = cfg.source.defect.expect("defect");
    assert_eq!((defect.x, defect.y, defect.delta, defect.from_frame), (40, 50, 70, 1));
    assert_eq!(cfg.profile.product_id, "bracket-a");
    assert_eq!(
        cfg.profile.record_path.as_deref(),
        Some(std::path::Path::new("/srv/profiles/bracket-a.toml"))
    );
    assert_eq!(cfg.health_log_interval, Duration::from_secs(3));

    let synthetic = cfg.synthetic_config();
    assert_eq!((synthetic.width, synthetic.height), (320, 240));
    assert_eq!(synthetic.target_fps, 25);

    clear_env();
}

#[test]
fn toml_files_are_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
health_log_secs = 5

[pipeline]
target_fps = 5
min_defect_area = 32

[pipeline.threshold]
mode = "adaptive"
min_cutoff = 12.5

[source]
scene = "blocks"
block_size = 16
seed = 99
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("INSPECT_DIFF_THRESHOLD", "55");
    let cfg = InspectdConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.pipeline.target_fps, 5);
    assert_eq!(cfg.pipeline.min_defect_area, 32);
    // The env cutoff replaces the file's adaptive mode.
    assert_eq!(cfg.pipeline.threshold, ThresholdMode::Fixed { cutoff: 55.0 });
    assert_eq!(
        cfg.source.scene,
        SceneKind::Blocks {
            block_size: 16,
            seed: 99
        }
    );
    assert_eq!(cfg.source.url, "stub://line_camera");

    clear_env();
}

#[test]
fn defaults_apply_without_a_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = InspectdConfig::load().expect("load defaults");
    assert_eq!(cfg.pipeline.target_fps, 10);
    assert_eq!(cfg.pipeline.ring_buffer_capacity, 4);
    assert_eq!(cfg.pipeline.threshold, ThresholdMode::Fixed { cutoff: 40.0 });
    assert_eq!(cfg.profile.product_id, "synthetic-part");
    assert!(cfg.profile.record_path.is_none());

    clear_env();
}

#[test]
fn invalid_values_refuse_to_load() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("INSPECT_TARGET_FPS", "0");
    assert!(InspectdConfig::load().is_err());
    std::env::set_var("INSPECT_TARGET_FPS", "fast");
    assert!(InspectdConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "pipeline": { "ring_buffer_capacity": 2, "max_in_flight_frames": 3 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    let err = InspectdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("max_in_flight_frames"));

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{ "source": { "scene": "stripes" } }"#)
        .expect("write config");
    assert!(InspectdConfig::load_from(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    let err = InspectdConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
