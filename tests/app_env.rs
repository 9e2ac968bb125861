use std::env;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use fleet_sync::app::FleetSyncApp;
use fleet_sync::config::Settings;
use fleet_sync::error::CycleError;
use fleet_sync::version::{resolve_source, SourceOrigin};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn reset_fleet_env() {
    for key in [
        "FLEET_SYNC_ENV_FILE",
        "FLEET_SYNC_INSTALL_DIR",
        "FLEET_SYNC_SCRIPTS_DIR",
        "FLEET_SYNC_VERSION_FILE",
        "FLEET_SYNC_LOCK_FILE",
        "FLEET_SYNC_LOG_FILE",
        "FLEET_SYNC_STATE_DIR",
        "FLEET_SYNC_BRANCH",
        "FLEET_SYNC_BASE_URL",
        "FLEET_SYNC_SELF_URL",
        "FLEET_SYNC_DEFAULT_REPO",
        "FLEET_SYNC_TRANSPORT",
        "FLEET_SYNC_CONNECT_TIMEOUT_SECS",
        "FLEET_SYNC_MAX_TIME_SECS",
        "FLEET_SYNC_RETRIES",
        "FLEET_SYNC_RETRY_DELAY_SECS",
        "FLEET_SYNC_LOCK_TIMEOUT_SECS",
    ] {
        env::remove_var(key);
    }
}

fn point_env_file_at(dir: &Path, contents: &str) {
    let env_file = dir.join("fleet-sync.env");
    fs::write(&env_file, contents).expect("write env file");
    env::set_var("FLEET_SYNC_ENV_FILE", &env_file);
}

fn curl_available() -> bool {
    which::which("curl").is_ok()
}

#[test]
fn settings_load_reads_env_file_and_derives_paths() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let install = temp.path().join("agent");
    point_env_file_at(
        temp.path(),
        &format!(
            "FLEET_SYNC_INSTALL_DIR={}\nFLEET_SYNC_BRANCH=beta\nFLEET_SYNC_RETRIES=5\nFLEET_SYNC_LOCK_TIMEOUT_SECS=900\n",
            install.display()
        ),
    );

    let settings = Settings::load().expect("load settings");
    assert_eq!(settings.install_dir, install);
    assert_eq!(settings.scripts_dir, install.join("scripts"));
    assert_eq!(settings.lock_file, install.join("run").join("update.lock"));
    assert_eq!(settings.source.channel.as_deref(), Some("beta"));
    assert_eq!(settings.transport.retries, 5);
    assert_eq!(settings.lock_timeout_secs, 900);

    let source = resolve_source(&settings.source);
    assert_eq!(source.origin, SourceOrigin::Default);
    assert!(source.base_url.ends_with("/beta"));

    reset_fleet_env();
}

#[test]
fn invalid_numbers_fall_back_to_defaults() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    let temp = tempfile::tempdir().expect("tempdir");
    point_env_file_at(
        temp.path(),
        "FLEET_SYNC_MAX_TIME_SECS=soon\nFLEET_SYNC_RETRIES=-1\n",
    );

    let settings = Settings::load().expect("load settings");
    assert_eq!(settings.transport.max_time_secs, 60);
    assert_eq!(settings.transport.retries, 3);
    assert!(settings.doctor_report().warnings.is_empty());

    reset_fleet_env();
}

#[test]
fn self_url_env_drives_inference() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    let temp = tempfile::tempdir().expect("tempdir");
    point_env_file_at(
        temp.path(),
        "FLEET_SYNC_SELF_URL=https://raw.example/org/agent/main/fleet-sync\nFLEET_SYNC_BRANCH=canary\n",
    );

    let settings = Settings::load().expect("load settings");
    let source = resolve_source(&settings.source);
    assert_eq!(source.origin, SourceOrigin::Inferred);
    assert_eq!(source.base_url, "https://raw.example/org/agent/canary");

    reset_fleet_env();
}

#[test]
fn unlock_requires_confirmation_and_removes_any_lock() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = Settings::rooted_at(temp.path());
    fs::create_dir_all(settings.lock_file.parent().expect("lock parent")).expect("run dir");
    fs::write(&settings.lock_file, "31337\n").expect("seed lock");
    let app = FleetSyncApp::new(settings.clone());

    let err = app
        .force_unlock_json(false)
        .expect_err("unlock without confirm");
    assert!(err.to_string().contains("--confirm"));
    assert!(settings.lock_file.exists());

    let payload: serde_json::Value =
        serde_json::from_str(&app.force_unlock_json(true).expect("unlock")).expect("json");
    assert_eq!(payload["removed"], true);
    assert_eq!(payload["previous"]["owner"], 31337);
    assert!(!settings.lock_file.exists());
}

#[test]
fn status_reports_missing_install_cleanly() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let app = FleetSyncApp::new(Settings::rooted_at(temp.path().join("absent")));

    let payload: serde_json::Value =
        serde_json::from_str(&app.status_json().expect("status")).expect("json");
    assert_eq!(payload["status"], "ok");
    assert!(payload["local_version"].is_null());
    assert_eq!(payload["lock"]["report"]["exists"], false);
    assert_eq!(payload["cycles"]["total"], 0);
}

#[test]
fn forced_missing_tool_fails_cycle_and_is_recorded() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::rooted_at(temp.path());
    settings.transport.tool = Some("no-such-downloader".to_string());
    let app = FleetSyncApp::new(settings.clone());

    let err = app.run_cycle().expect_err("no tool");
    assert!(matches!(err, CycleError::ToolUnavailable(_)));
    assert_eq!(err.exit_code(), 1);

    let log_text = fs::read_to_string(&settings.log_file).expect("log");
    assert!(log_text.contains("[ERROR] Update cycle failed: no download tool available"));

    let payload: serde_json::Value =
        serde_json::from_str(&app.status_json().expect("status")).expect("json");
    assert_eq!(payload["cycles"]["failed"], 1);
    assert_eq!(payload["last_cycle"]["error_kind"], "tool_unavailable");
}

#[test]
fn curl_backed_cycle_installs_from_file_urls() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    if !curl_available() {
        eprintln!("curl not installed; skipping");
        return;
    }

    let temp = tempfile::tempdir().expect("tempdir");
    let remote = temp.path().join("remote");
    fs::create_dir_all(remote.join("scripts")).expect("remote dirs");
    fs::write(remote.join("VERSION"), "3.1.0\n").expect("remote version");
    fs::write(remote.join("manifest.txt"), "health.sh health\n").expect("manifest");
    fs::write(remote.join("scripts").join("health.sh"), "#!/bin/sh\n").expect("asset");

    let mut settings = Settings::rooted_at(temp.path().join("install"));
    settings.source.base_url = Some(format!("file://{}", remote.display()));
    settings.transport.tool = Some("curl".to_string());
    settings.transport.retries = 0;
    let app = FleetSyncApp::new(settings.clone());

    app.run_cycle().expect("first cycle");
    assert_eq!(
        fs::read_to_string(&settings.version_file).expect("marker"),
        "3.1.0\n"
    );
    assert!(settings.scripts_dir.join("health.sh").exists());

    app.run_cycle().expect("second cycle");
    let payload: serde_json::Value =
        serde_json::from_str(&app.status_json().expect("status")).expect("json");
    assert_eq!(payload["local_version"], "3.1.0");
    assert_eq!(payload["cycles"]["updated"], 1);
    assert_eq!(payload["cycles"]["up_to_date"], 1);
    assert_eq!(payload["last_cycle"]["status"], "up_to_date");

    let check: serde_json::Value =
        serde_json::from_str(&app.check_json().expect("check")).expect("json");
    assert_eq!(check["report"]["up_to_date"], true);
    assert_eq!(check["transport"], "curl");
}

#[cfg(unix)]
#[test]
fn contended_cycle_leaves_cycle_record_to_lock_holder() {
    let _guard = ENV_LOCK.lock().expect("env lock");
    reset_fleet_env();
    if !curl_available() {
        eprintln!("curl not installed; skipping");
        return;
    }

    let temp = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::rooted_at(temp.path());
    settings.source.base_url = Some(format!("file://{}", temp.path().join("remote").display()));
    settings.transport.tool = Some("curl".to_string());
    fs::create_dir_all(settings.lock_file.parent().expect("lock parent")).expect("run dir");

    let mut holder = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn lock holder");
    fs::write(&settings.lock_file, format!("{}\n", holder.id())).expect("seed lock");

    let result = FleetSyncApp::new(settings.clone()).run_cycle();
    let _ = holder.kill();
    let _ = holder.wait();

    match result {
        Err(CycleError::LockContention { owner }) => assert_eq!(owner, holder.id()),
        other => panic!("expected lock contention, got {other:?}"),
    }
    assert!(settings.lock_file.exists());
    assert!(!settings.cycle_record_file().exists());
}
