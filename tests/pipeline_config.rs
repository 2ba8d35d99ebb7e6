use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use trafficcam::config::PipelineConfig;
use trafficcam::detect::CountBucket;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TRAFFIC_CONFIG",
        "TRAFFIC_RAW_DIR",
        "TRAFFIC_UPLOAD_DIR",
        "TRAFFIC_ARCHIVE_DIR",
        "TRAFFIC_MAX_IN_FLIGHT",
        "TRAFFIC_THRESHOLD",
        "TRAFFIC_SAMPLE_RATE",
        "TRAFFIC_ARCHIVE_STORE",
        "TRAFFIC_TELEMETRY_SINK",
        "TRAFFIC_ACCESS_KEY",
        "TRAFFIC_SECRET_KEY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_match_the_deployed_pipeline() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.catalog.max_locations, 50);
    assert_eq!(cfg.fetch.pool_width, 20);
    assert_eq!(cfg.fetch.min_image_bytes, 11_000);
    assert_eq!(cfg.detect.threshold, 0.4);
    assert_eq!(cfg.archive.bucket, "ourcamera");
    assert_eq!(cfg.dirs.raw_dir, PathBuf::from("/tmp/rawimages/"));
    assert_eq!(cfg.pipeline.max_files_in_flight, 200);
    assert_eq!(cfg.detect.buckets.get("ups"), Some(&CountBucket::Trucks));
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "dirs": { "raw_dir": "/data/raw", "upload_dir": "/data/up" },
        "fetch": { "pool_width": 8, "min_image_bytes": 9000 },
        "detect": { "threshold": 0.6, "buckets": { "car": "cars", "bus": "trucks" } },
        "archive": { "store": "https://archive.example.net", "upload_workers": 2, "grace_secs": 5 },
        "telemetry": { "sink": "sqlite:/data/traffic.db" },
        "pipeline": { "max_files_in_flight": 50, "backpressure_sleep_ms": 250 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("TRAFFIC_CONFIG", file.path());
    std::env::set_var("TRAFFIC_RAW_DIR", "/mnt/raw");
    std::env::set_var("TRAFFIC_SAMPLE_RATE", "0.5");
    std::env::set_var("TRAFFIC_ACCESS_KEY", "AKIAEXAMPLE");
    std::env::set_var("TRAFFIC_SECRET_KEY", "hunter2");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.dirs.raw_dir, PathBuf::from("/mnt/raw"));
    assert_eq!(cfg.dirs.upload_dir, PathBuf::from("/data/up"));
    assert_eq!(cfg.fetch.pool_width, 8);
    assert_eq!(cfg.fetch.min_image_bytes, 9000);
    assert_eq!(cfg.detect.threshold, 0.6);
    assert_eq!(cfg.detect.buckets.len(), 2);
    assert_eq!(cfg.archive.store, "https://archive.example.net");
    assert_eq!(cfg.archive.upload_workers, 2);
    assert_eq!(cfg.archive.grace, Duration::from_secs(5));
    assert_eq!(cfg.archive.access_key.as_deref(), Some("AKIAEXAMPLE"));
    assert_eq!(cfg.telemetry_sink, "sqlite:/data/traffic.db");
    assert_eq!(cfg.pipeline.max_files_in_flight, 50);
    assert_eq!(cfg.pipeline.backpressure_sleep, Duration::from_millis(250));
    assert_eq!(cfg.pipeline.annotate_sample_rate, 0.5);

    let debug = format!("{:?}", cfg.archive);
    assert!(!debug.contains("hunter2"));

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        [catalog]
        max_locations = 5

        [detect]
        backend = "stub"
        threshold = 0.35
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    let cfg = PipelineConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.catalog.max_locations, 5);
    assert_eq!(cfg.detect.threshold, 0.35);

    clear_env();
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("TRAFFIC_THRESHOLD", "1.5");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("TRAFFIC_MAX_IN_FLIGHT", "many");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    std::env::set_var("TRAFFIC_MAX_IN_FLIGHT", "0");
    assert!(PipelineConfig::load().is_err());
    clear_env();
}
