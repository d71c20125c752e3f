// Engine state surface as seen by the HTTP layer: status documents,
// snapshots, and session persistence through the public API.

use wxbridge_engine::engine::EngineOptions;
use wxbridge_engine::trace::TraceOptions;
use wxbridge_engine::Engine;

fn options(dir: &std::path::Path) -> EngineOptions {
    EngineOptions {
        entry_host: "szfilehelper.weixin.qq.com".to_string(),
        state_path: dir.join("state.json"),
        max_upload_size: 25 * 1024 * 1024,
        login_callback_url: String::new(),
        trace: TraceOptions {
            enabled: false,
            redact: true,
            max_body: 4096,
            dir: dir.to_path_buf(),
        },
    }
}

#[test]
fn fresh_engine_reports_init_status() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(options(dir.path())).unwrap();

    let status = engine.login_status_detail();
    assert_eq!(status["logged_in"], false);
    assert_eq!(status["status"], "init");
    assert_eq!(status["has_uuid"], false);
    assert_eq!(status["entry_host"], "szfilehelper.weixin.qq.com");
    assert_eq!(status["login_host"], "login.wx2.qq.com");
    assert!(status["uuid_age_seconds"].is_null());
}

#[test]
fn state_snapshot_names_the_derived_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(options(dir.path())).unwrap();

    let snapshot = engine.state_snapshot();
    assert_eq!(snapshot["mode"], "direct_protocol");
    assert_eq!(snapshot["file_host"], "file.wx2.qq.com");
    assert_eq!(snapshot["is_logged_in"], false);
}

#[test]
fn session_save_and_reload_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(options(dir.path())).unwrap();

    engine.save_session().unwrap();
    assert!(dir.path().join("state.json").exists());

    // A second engine restores the same document.
    let other = Engine::new(options(dir.path())).unwrap();
    other.load_session_from_disk().unwrap();
    assert_eq!(other.entry_host(), engine.entry_host());
    assert!(!other.has_auth());
}

#[test]
fn self_sent_lookup_is_empty_for_strangers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(options(dir.path())).unwrap();
    assert!(!engine.is_self_sent("12345"));
}
