//! End-to-end pipeline scenarios against the mock server.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scope_acq::acquisition::MonitorConfig;
use scope_acq::config::{FailurePolicy, ModalityConfig, SessionConfig, StitchingConfig};
use scope_acq::device::{ConnectionConfig, DeviceConnection, MockJob, MockMicroscopeServer};
use scope_acq::orchestrator::{
    AcquisitionOrchestrator, AcquisitionTarget, ConfigProfileResolver, OrchestratorConfig,
    TargetStatus,
};
use scope_acq::protocol::AngleExposure;
use tempfile::TempDir;

fn modality(angles: Vec<AngleExposure>) -> ModalityConfig {
    ModalityConfig {
        objective: "OBJ_20X".into(),
        detector: "CAM_JAI".into(),
        pixel_size_um: 0.5,
        angles,
        laser: None,
        averaging: None,
        z_stack: None,
        autofocus: None,
        background: None,
        processing: Vec::new(),
    }
}

fn orchestrator(server: &MockMicroscopeServer, projects: &Path) -> AcquisitionOrchestrator {
    let mut conn = ConnectionConfig::new("127.0.0.1", server.port());
    conn.acquire_payload_delay = Duration::from_millis(1);
    conn.health.enabled = false;

    let config = OrchestratorConfig {
        session: SessionConfig {
            yaml_path: projects.join("config_PPM.yml"),
            projects_folder: projects.to_path_buf(),
            sample_name: "slide_1".into(),
            scan_type: "ppm_20x_1".into(),
            parent_image: Some("slide_1.svs".into()),
        },
        stitching: StitchingConfig::default(),
        monitor: MonitorConfig {
            poll_interval: Duration::from_millis(5),
            inactivity_timeout: Duration::from_secs(2),
            startup_retry_attempts: 2,
            startup_retry_delay: Duration::from_millis(5),
        },
        failure_policy: FailurePolicy::Abort,
    };
    let resolver = ConfigProfileResolver::new(BTreeMap::from([
        ("bf".to_string(), modality(Vec::new())),
        (
            "ppm".to_string(),
            modality(vec![AngleExposure::new(-5.0, 1.5), AngleExposure::new(5.0, 1.5)]),
        ),
    ]));
    AcquisitionOrchestrator::new(DeviceConnection::new(conn), config, Arc::new(resolver))
}

/// Lay out tiles the way the server writes them.
fn target(projects: &Path, name: &str, modality: &str, angles: &[f64]) -> AcquisitionTarget {
    let dir = projects.join("slide_1").join("ppm_20x_1").join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("TileConfiguration.txt"),
        "tile_0.tif; ; (100.0, 50.0)\ntile_1.tif; ; (600.0, 50.0)\n",
    )
    .unwrap();
    let tile_dirs: Vec<_> = if angles.is_empty() {
        vec![dir.clone()]
    } else {
        angles.iter().map(|a| dir.join(format!("{a}"))).collect()
    };
    for tile_dir in tile_dirs {
        fs::create_dir_all(&tile_dir).unwrap();
        fs::write(tile_dir.join("tile_0.tif"), b"tif").unwrap();
        fs::write(tile_dir.join("tile_1.tif"), b"tif").unwrap();
    }
    AcquisitionTarget::new(name, dir, modality)
}

#[tokio::test]
async fn test_misconfigured_target_is_isolated() {
    let server = MockMicroscopeServer::start().await.unwrap();
    server.push_job(MockJob::completes_after(2, 2));
    server.push_job(MockJob::completes_after(2, 2));
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&server, tmp.path());

    let targets = vec![
        target(tmp.path(), "A", "bf", &[]),
        target(tmp.path(), "B", "no_such_modality", &[]),
        target(tmp.path(), "C", "bf", &[]),
    ];
    let result = orch.run(targets).await.unwrap();

    assert!(!result.aborted);
    assert!(result.is_partial_success());
    assert_eq!(result.succeeded(), 2);
    assert!(matches!(
        result.target("B").unwrap().status,
        TargetStatus::StartFailed(_)
    ));

    // only A and C reached the server, in order
    let messages = server.acquisitions();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].contains("--region A"));
    assert!(messages[1].contains("--region C"));

    // both were stitched
    assert_eq!(result.stitches.len(), 2);
    assert!(result.stitches.iter().all(|s| s.result.is_ok()));
    let out_dir = tmp.path().join("slide_1").join("SlideImages");
    assert!(out_dir.join("slide_1_ppm_20x_1_A.ome.tif.json").is_file());
    assert!(out_dir.join("slide_1_ppm_20x_1_C.ome.tif.json").is_file());
}

#[tokio::test]
async fn test_multi_angle_target_stitches_each_angle() {
    let server = MockMicroscopeServer::start().await.unwrap();
    server.push_job(MockJob::completes_after(3, 4));
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&server, tmp.path());

    let result = orch
        .run(vec![target(tmp.path(), "A", "ppm", &[-5.0, 5.0])])
        .await
        .unwrap();

    assert!(result.is_success());
    // two tiles at each of two angles
    let outcome = result.target("A").unwrap();
    assert_eq!(outcome.expected_files, 4);
    assert_eq!(orch.progress().get().total, 4);
    assert!(server.acquisitions()[0].contains("--angles \"(-5.0,5.0)\""));

    let outputs = result.stitches[0].result.as_ref().unwrap();
    assert_eq!(outputs.len(), 2);
    assert!(outputs[0].ends_with("slide_1_ppm_20x_1_A_-5.ome.tif.json"));
    assert!(outputs[1].ends_with("slide_1_ppm_20x_1_A_5.ome.tif.json"));
}

#[tokio::test]
async fn test_cancelled_target_gets_no_stitch_job() {
    let server = MockMicroscopeServer::start().await.unwrap();
    server.push_job(MockJob::stalls_at(1, 2));
    server.push_job(MockJob::completes_after(1, 2));
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&server, tmp.path());
    let handle = orch.handle();

    let watcher = {
        let server = server.clone();
        tokio::spawn(async move {
            while server.acquisitions().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel_current()
        })
    };

    let targets = vec![
        target(tmp.path(), "A", "bf", &[]),
        target(tmp.path(), "B", "bf", &[]),
    ];
    let result = orch.run(targets).await.unwrap();

    assert_eq!(watcher.await.unwrap().as_deref(), Some("A"));
    assert_eq!(server.cancel_requests(), 1);
    let a = result.target("A").unwrap();
    assert_eq!(a.status, TargetStatus::Cancelled);
    assert!(a.stitch_job.is_none());
    assert_eq!(result.target("B").unwrap().status, TargetStatus::Acquired);
    assert_eq!(result.stitches.len(), 1);
    assert_eq!(result.stitches[0].target, "B");
}

#[tokio::test]
async fn test_progress_handle_reaches_total() {
    let server = MockMicroscopeServer::start().await.unwrap();
    server.push_job(MockJob::completes_after(2, 2));
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(&server, tmp.path());
    let progress = orch.progress();

    orch.run(vec![target(tmp.path(), "A", "bf", &[])])
        .await
        .unwrap();
    let last = progress.get();
    assert_eq!((last.current, last.total), (2, 2));
}
