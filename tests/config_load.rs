use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use barcode_capture::{CaptureConfig, Facing, FlashMode, FocusMode, Rotation, Size};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAPTURE_CONFIG",
        "CAPTURE_FPS",
        "CAPTURE_WIDTH",
        "CAPTURE_HEIGHT",
        "CAPTURE_FACING",
        "CAPTURE_FOCUS_MODE",
        "CAPTURE_FLASH_MODE",
        "CAPTURE_BUFFER_COUNT",
        "CAPTURE_DISPLAY_ROTATION",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = CaptureConfig::load().expect("load config");
    assert_eq!(cfg, CaptureConfig::default());
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "fps": 24.0,
        "preview": { "width": 1280, "height": 720 },
        "facing": "front",
        "focus_mode": "continuous-video",
        "flash_mode": "torch",
        "buffer_count": 6,
        "display_rotation": 180,
        "shutdown_warn_ms": 500
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_FPS", "15");
    std::env::set_var("CAPTURE_FLASH_MODE", "off");

    let cfg = CaptureConfig::load().expect("load config");

    assert_eq!(cfg.requested_fps, 15.0);
    assert_eq!(cfg.preview_size, Size::new(1280, 720));
    assert_eq!(cfg.facing, Facing::Front);
    assert_eq!(cfg.focus_mode, Some(FocusMode::ContinuousVideo));
    assert_eq!(cfg.flash_mode, Some(FlashMode::Off));
    assert_eq!(cfg.buffer_count, 6);
    assert_eq!(cfg.display_rotation, Rotation::Deg180);
    assert_eq!(cfg.shutdown_warn_after, Duration::from_millis(500));

    clear_env();
}

#[test]
fn loads_toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
fps = 60.0
facing = "back"

[preview]
width = 640
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    std::env::set_var("CAPTURE_CONFIG", file.path());
    std::env::set_var("CAPTURE_HEIGHT", "360");

    let cfg = CaptureConfig::load().expect("load config");
    assert_eq!(cfg.requested_fps, 60.0);
    assert_eq!(cfg.facing, Facing::Back);
    assert_eq!(cfg.preview_size, Size::new(640, 360));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("CAPTURE_FPS", "fast");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_FACING", "sideways");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_WIDTH", "0");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    std::env::set_var("CAPTURE_DISPLAY_ROTATION", "45");
    assert!(CaptureConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ not json").expect("write config");
    std::env::set_var("CAPTURE_CONFIG", file.path());
    assert!(CaptureConfig::load().is_err());
    clear_env();
}
