use std::{fs, time::Duration};

use loadout::{
    config::Config,
    dev_server::{self, DevEvent, DevSession, DevState},
    manifest::{MANIFEST_FILE, Manifest},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
[entries]
app = ["./src/app.js"]
admin = ["./src/admin.js"]

[output]
filename = "[name].[hash:8].js"

[dev_server]
debounce_ms = 20
"#;

fn project() -> (TempDir, Config) {
    let dir = TempDir::new().expect("temp dir");
    let src = dir.path().join("src");
    fs::create_dir_all(&src).expect("mkdir");
    fs::write(src.join("app.js"), "require('./shared');\n").expect("write");
    fs::write(src.join("admin.js"), "console.log('admin');\n").expect("write");
    fs::write(src.join("shared.js"), "module.exports = 1;\n").expect("write");
    let config_path = dir.path().join("loadout.toml");
    fs::write(&config_path, CONFIG).expect("write config");
    let config = Config::load(&config_path).expect("config");
    (dir, config)
}

fn manifest_on_disk(dir: &TempDir) -> Manifest {
    Manifest::read(&dir.path().join("dist").join(MANIFEST_FILE))
        .expect("readable")
        .expect("manifest written")
}

#[tokio::test]
async fn test_unresolvable_specifier_fails_only_its_bundle() {
    let (dir, config) = project();
    let mut session = DevSession::new(config, true).expect("session");
    session.start(CancellationToken::new()).await.expect("start");
    let before = manifest_on_disk(&dir);
    let admin_before = before.entries["admin"].clone();
    let app_before = before.entries["app"].clone();

    let app = dir.path().join("src/app.js");
    fs::write(&app, "require('./shared');\nrequire('./gone');\n").expect("write");
    let outcome = session
        .rebuild(&[app.clone()], CancellationToken::new())
        .await
        .expect("rebuild");

    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].entries, vec!["app".to_owned()]);
    let after = manifest_on_disk(&dir);
    assert_eq!(after.entries["admin"], admin_before);
    assert_eq!(after.entries["app"], app_before);
    let app_file = dir.path().join("dist").join(&app_before[0].path);
    assert!(app_file.exists());

    fs::write(&app, "require('./shared');\n// fixed\n").expect("write");
    let recovered = session
        .rebuild(&[app], CancellationToken::new())
        .await
        .expect("rebuild");
    assert!(recovered.failures.is_empty());
    assert_ne!(recovered.manifest.entries["app"], app_before);
    assert_eq!(recovered.manifest.entries["admin"], admin_before);
}

#[tokio::test]
async fn test_changed_dependency_rebuilds_its_importers() {
    let (dir, config) = project();
    let mut session = DevSession::new(config, false).expect("session");
    let first = session.start(CancellationToken::new()).await.expect("start");

    let shared = dir.path().join("src/shared.js");
    fs::write(&shared, "module.exports = 2;\n").expect("write");
    let second = session
        .rebuild(&[shared], CancellationToken::new())
        .await
        .expect("rebuild");

    assert_ne!(first.manifest.entries["app"], second.manifest.entries["app"]);
    assert_eq!(first.manifest.entries["admin"], second.manifest.entries["admin"]);
    let served = session.served();
    let served = served.read().await;
    let bundle = served
        .file(&second.manifest.entries["app"][0].path)
        .expect("served bundle");
    assert!(String::from_utf8_lossy(&bundle.bytes).contains("module.exports = 2;"));
}

#[tokio::test]
async fn test_watch_loop_reloads_on_change_and_stops() {
    let (dir, config) = project();
    let mut session = DevSession::new(config, false).expect("session");
    session.start(CancellationToken::new()).await.expect("start");
    let mut events = session.subscribe();

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let watcher = tokio::spawn(async move {
        dev_server::watch(&mut session, stop).await.expect("watch");
        session
    });

    let admin = dir.path().join("src/admin.js");
    let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
        let mut version = 0;
        loop {
            version += 1;
            fs::write(&admin, format!("console.log('admin v{version}');\n")).expect("write");
            let waited =
                tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
            if let Ok(Ok(DevEvent::Reload { changed })) = waited {
                return changed;
            }
        }
    })
    .await
    .expect("reload event before timeout");
    assert!(reloaded.iter().all(|path| path.starts_with("admin.")));

    shutdown.cancel();
    let session = watcher.await.expect("watch task");
    assert_eq!(session.state(), DevState::Stopped);
}
