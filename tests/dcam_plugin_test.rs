//! Lifecycle tests for the DCAM camera plugin against the simulated device
//! (default features; no vendor SDK required).

use daq_hamamatsu::config::Settings;
use daq_hamamatsu::core::{DataDim, DataExport, SettingValue, ViewerPlugin};
use daq_hamamatsu::plugins::viewer_2d::DcamViewer;
use std::sync::Arc;
use std::time::Duration;

async fn recv_export(rx: &mut tokio::sync::broadcast::Receiver<DataExport>) -> DataExport {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(export)) => return export,
            // A slow consumer may lag behind a fast stream; keep reading.
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(err)) => panic!("data channel closed: {err}"),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }
}

/// Stage and commit a small ROI so frame generation stays cheap.
async fn commit_small_roi(plugin: &mut DcamViewer, width: u32, height: u32) {
    plugin
        .commit_setting("hsize", SettingValue::Int(width as i64))
        .await
        .expect("stage hsize");
    plugin
        .commit_setting("vsize", SettingValue::Int(height as i64))
        .await
        .expect("stage vsize");
    plugin
        .commit_setting("commit_roi", SettingValue::Bool(true))
        .await
        .expect("commit roi");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_shot_lifecycle() {
    let settings = Arc::new(Settings::default());
    let mut plugin = DcamViewer::new();

    let status = plugin
        .initialize(&settings, None)
        .await
        .expect("initialize");
    assert!(status.initialized);
    assert!(status.info.contains("1920x1200"));

    // Exposure setting is applied to the device and read back.
    plugin
        .commit_setting("exposure_ms", SettingValue::Float(5.0))
        .await
        .expect("commit exposure");
    let descriptors = plugin.setting_descriptors();
    let exposure = descriptors.iter().find(|d| d.name == "exposure_ms").unwrap();
    assert!((exposure.value.as_f64().unwrap() - 5.0).abs() < 1e-9);
    let model = descriptors.iter().find(|d| d.name == "camera_model").unwrap();
    assert!(!model.enabled);

    commit_small_roi(&mut plugin, 64, 32).await;

    let mut rx = plugin.data_channel().expect("data channel");
    plugin.grab(1).await.expect("grab");
    let export = recv_export(&mut rx).await;
    assert_eq!(export.dim, DataDim::Data2D);
    assert_eq!(export.samples.len(), 64 * 32);
    assert_eq!(export.axes[0].data.len(), 32);
    assert_eq!(export.axes[1].data.len(), 64);

    plugin.stop().await.expect("stop");
    plugin.close().await.expect("close");
    plugin.close().await.expect("second close");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_roi_changes_are_staged_until_commit() {
    let settings = Arc::new(Settings::default());
    let mut plugin = DcamViewer::new();
    plugin
        .initialize(&settings, None)
        .await
        .expect("initialize");

    plugin
        .commit_setting("hpos", SettingValue::Int(10))
        .await
        .expect("stage hpos");
    plugin
        .commit_setting("hsize", SettingValue::Int(20))
        .await
        .expect("stage hsize");
    plugin
        .commit_setting("vpos", SettingValue::Int(10))
        .await
        .expect("stage vpos");
    plugin
        .commit_setting("vsize", SettingValue::Int(20))
        .await
        .expect("stage vsize");

    // Nothing reaches the device before the explicit commit.
    assert_eq!(plugin.committed_roi().hpos, 0);
    assert_eq!(plugin.committed_roi().hsize, 1920);
    assert_eq!(plugin.staged_roi().x0, 10);

    plugin
        .commit_setting("commit_roi", SettingValue::Bool(true))
        .await
        .expect("commit roi");

    let committed = plugin.committed_roi();
    assert_eq!(committed.hpos, 10);
    assert_eq!(committed.hsize, 20);
    assert_eq!(committed.vpos, 10);
    assert_eq!(committed.vsize, 20);
    // The staged request resets to the new full view.
    assert_eq!(plugin.staged_roi().x0, 0);
    assert_eq!(plugin.staged_roi().width, 20);

    plugin.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_continuous_stream_and_stop() {
    let settings = Arc::new(Settings::default());
    let mut plugin = DcamViewer::new();
    plugin
        .initialize(&settings, None)
        .await
        .expect("initialize");

    plugin
        .commit_setting("exposure_ms", SettingValue::Float(5.0))
        .await
        .expect("commit exposure");
    commit_small_roi(&mut plugin, 32, 32).await;
    plugin
        .commit_setting("acq_mode", SettingValue::from("continuous"))
        .await
        .expect("switch mode");

    let mut rx = plugin.data_channel().expect("data channel");
    plugin.grab(1).await.expect("start stream");

    let first = recv_export(&mut rx).await;
    let second = recv_export(&mut rx).await;
    assert_eq!(first.samples.len(), 32 * 32);
    assert_eq!(second.samples.len(), 32 * 32);
    // The worker tags frames and reports the smoothed rate from the second
    // completion onwards.
    let metadata = second.metadata.expect("frame metadata");
    assert!(metadata["frame"].as_u64().unwrap() >= 1);
    assert!(metadata["fps"].is_number() || metadata["fps"].is_null());

    // Stop always succeeds and ends the worker; a repeated grab in single
    // mode still works afterwards.
    plugin.stop().await.expect("stop");
    plugin
        .commit_setting("acq_mode", SettingValue::from("single"))
        .await
        .expect("switch back");
    let mut rx = plugin.data_channel().expect("data channel");
    plugin.grab(1).await.expect("grab after stop");
    recv_export(&mut rx).await;

    plugin.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slave_shares_master_controller() {
    let settings = Arc::new(Settings::default());
    let mut master = DcamViewer::new();
    master
        .initialize(&settings, None)
        .await
        .expect("initialize master");

    let mut slave = DcamViewer::new();
    let status = slave
        .initialize(&settings, master.controller())
        .await
        .expect("initialize slave");
    assert!(status.initialized);
    assert!(status.info.contains("1920x1200"));

    slave.close().await.expect("close slave");
    master.close().await.expect("close master");
}
