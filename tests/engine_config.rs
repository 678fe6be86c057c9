use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use sentry_engine::config::{BufferMode, EngineConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTRY_CONFIG",
        "SENTRY_DB_PATH",
        "SENTRY_MEDIA_DIR",
        "SENTRY_CAMERA_DEVICE",
        "SENTRY_GALLERY_DIR",
        "SENTRY_DASHBOARD_URL",
        "SENTRY_BUFFER_MODE",
        "SENTRY_ALERT_INTERVAL_SECS",
        "SENTRY_CLIP_INTERVAL_SECS",
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
        "db_path": "sentry_prod.db",
        "media_dir": "/var/lib/sentry/media",
        "dashboard_url": "http://dash.local/api",
        "buffer_mode": "continuous",
        "camera": {
            "device": "/dev/video2",
            "target_fps": 15,
            "width": 640,
            "height": 480
        },
        "motion": {
            "threshold": 30,
            "min_area": 800,
            "frame_skip": 2
        },
        "recognition": {
            "gallery_dir": "/var/lib/sentry/known_faces",
            "backend": "stub",
            "distance_threshold": 4.0,
            "queue_cap": 16
        },
        "alerts": {
            "interval_secs": 60,
            "snapshot_cap": 6,
            "mail_to": "owner@example.com",
            "mail_from": "cam@example.com"
        },
        "clip": {
            "interval_secs": 120,
            "fps": 24,
            "stabilize_timeout_secs": 20
        },
        "audio": {
            "enabled": true,
            "device": "sysdefault:CARD=webcam",
            "threshold": 1500.0
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SENTRY_CONFIG", file.path());
    std::env::set_var("SENTRY_CAMERA_DEVICE", "/dev/video0");
    std::env::set_var("SENTRY_ALERT_INTERVAL_SECS", "45");

    let cfg = EngineConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "sentry_prod.db");
    assert_eq!(cfg.media_dir.to_str().unwrap(), "/var/lib/sentry/media");
    assert_eq!(cfg.dashboard_url.as_deref(), Some("http://dash.local/api"));
    assert_eq!(cfg.buffer_mode, BufferMode::Continuous);

    // Env wins over the file.
    assert_eq!(cfg.camera.device, "/dev/video0");
    assert_eq!(cfg.camera.target_fps, 15);
    assert_eq!(cfg.camera.width, 640);
    assert_eq!(cfg.camera.height, 480);

    assert_eq!(cfg.motion.threshold, 30);
    assert_eq!(cfg.motion.min_area, 800);
    assert_eq!(cfg.motion.frame_skip, 2);

    assert_eq!(
        cfg.recognition.gallery_dir.to_str().unwrap(),
        "/var/lib/sentry/known_faces"
    );
    assert_eq!(cfg.recognition.backend, "stub");
    assert_eq!(cfg.recognition.queue_cap, 16);

    assert_eq!(cfg.alerts.interval, Duration::from_secs(45));
    assert_eq!(cfg.alerts.snapshot_cap, 6);
    assert_eq!(cfg.alerts.mail_to.as_deref(), Some("owner@example.com"));
    assert_eq!(cfg.alerts.mail_from, "cam@example.com");

    assert_eq!(cfg.clip.interval, Duration::from_secs(120));
    assert_eq!(cfg.clip.fps, 24);
    assert_eq!(cfg.clip.stabilize_timeout, Duration::from_secs(20));

    assert!(cfg.audio.enabled);
    assert_eq!(cfg.audio.device.as_deref(), Some("sysdefault:CARD=webcam"));
    assert_eq!(cfg.audio.threshold, 1500.0);

    clear_env();
}

#[test]
fn defaults_stand_alone() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EngineConfig::load().expect("defaults load");
    assert_eq!(cfg.db_path, "sentry.db");
    assert_eq!(cfg.buffer_mode, BufferMode::MotionGated);
    assert_eq!(cfg.camera.device, "stub://front_door");
    assert_eq!(cfg.motion.threshold, 25);
    assert_eq!(cfg.motion.min_area, 500);
    assert_eq!(cfg.alerts.interval, Duration::from_secs(30));
    assert_eq!(cfg.clip.interval, Duration::from_secs(60));
    assert!(cfg.alerts.mail_to.is_none());
    assert!(!cfg.audio.enabled);

    clear_env();
}

#[test]
fn invalid_settings_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "buffer_mode": "sometimes" }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("SENTRY_CONFIG", file.path());
    assert!(EngineConfig::load().is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "camera": { "target_fps": 0 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("SENTRY_CONFIG", file.path());
    assert!(EngineConfig::load().is_err());

    clear_env();
}
