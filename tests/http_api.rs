//! HTTP control surface tests against an in-process router.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

use ipcam_core::config::Config;
use ipcam_core::hw::session::MpiSystem;
use ipcam_core::hw::sim::SimCore;
use ipcam_core::hw::VideoCore;
use ipcam_core::pipeline::manager::PipelineManager;
use ipcam_core::web;

fn test_config(model_dir: &Path, record_dir: &Path) -> Config {
    Config::from_str(&format!(
        r#"
[video]
width = 320
height = 240
fps = 60

[detect]
model_dir = "{model}"

[record]
dir = "{record}"
"#,
        model = model_dir.display(),
        record = record_dir.display(),
    ))
    .unwrap()
}

async fn serve_rig() -> (Arc<PipelineManager>, MpiSystem, String, tempfile::TempDir, tempfile::TempDir) {
    let models = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    std::fs::write(models.path().join("yolov5.rknn"), b"m").unwrap();
    std::fs::write(models.path().join("retinaface.rknn"), b"m").unwrap();

    let core: Arc<dyn VideoCore> = Arc::new(SimCore::new(60));
    let mpi = MpiSystem::new(Arc::clone(&core)).unwrap();
    let manager = Arc::new(PipelineManager::new(
        core,
        test_config(models.path(), records.path()),
    ));
    manager.start().await.unwrap();

    let app = web::router(Arc::clone(&manager));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (manager, mpi, base, models, records)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_reflects_mode_and_consumers() {
    let (manager, _mpi, base, _m, _r) = serve_rig().await;
    let client = reqwest::Client::new();

    let status: Value = client
        .get(format!("{}/api/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["mode"], "parallel");
    assert_eq!(status["running"], true);
    assert_eq!(status["detector"], Value::Null);

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mode_and_model_switch_via_http() {
    let (manager, _mpi, base, _m, _r) = serve_rig().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/mode", base))
        .json(&json!({"mode": "serial"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let resp = client
        .post(format!("{}/api/model", base))
        .json(&json!({"model": "yolov5"}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let status: Value = client
        .get(format!("{}/api/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["mode"], "serial");
    assert_eq!(status["detector"], "yolov5");

    // Unknown model names are a client error.
    let resp = client
        .post(format!("{}/api/model", base))
        .json(&json!({"model": "ssd"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    manager.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn record_endpoints_drive_the_recorder() {
    let (manager, _mpi, base, _models, records) = serve_rig().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/record/start", base))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    sleep(Duration::from_millis(400)).await;

    let status: Value = client
        .get(format!("{}/api/status", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["recording"], true);

    let resp = client
        .post(format!("{}/api/record/stop", base))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    manager.stop().await;

    let files: Vec<_> = std::fs::read_dir(records.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 1);
}
