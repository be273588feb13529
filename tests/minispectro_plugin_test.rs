//! Lifecycle tests for the mini-spectrometer plugin against the simulated
//! device (default features; no vendor SDK required).

use daq_hamamatsu::config::Settings;
use daq_hamamatsu::core::{DataDim, SampleBuffer, SettingValue, ViewerPlugin};
use daq_hamamatsu::plugins::viewer_1d::MiniSpectroViewer;
use std::sync::Arc;
use std::time::Duration;

async fn recv_export(
    rx: &mut tokio::sync::broadcast::Receiver<daq_hamamatsu::core::DataExport>,
) -> daq_hamamatsu::core::DataExport {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for data")
        .expect("data channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_master_lifecycle() {
    let settings = Arc::new(Settings::default());
    let mut plugin = MiniSpectroViewer::new();

    let status = plugin
        .initialize(&settings, None)
        .await
        .expect("initialize");
    assert!(status.initialized);
    assert!(status.info.contains("C10084CA"));

    // The simulated device reports gain and trigger edge unavailable: both
    // controls come back disabled and forced to their defaults.
    let descriptors = plugin.setting_descriptors();
    let gain = descriptors.iter().find(|d| d.name == "gain").unwrap();
    assert!(!gain.enabled);
    assert_eq!(gain.value.as_str(), Some("low"));
    let integration = descriptors
        .iter()
        .find(|d| d.name == "integration_time_us")
        .unwrap();
    assert!(integration.enabled);
    assert_eq!(integration.value.as_i64(), Some(10_000));

    let mut rx = plugin.data_channel().expect("data channel");

    plugin.grab(1).await.expect("grab");
    let export = recv_export(&mut rx).await;
    assert_eq!(export.dim, DataDim::Data1D);
    assert_eq!(export.samples.len(), 2048);
    assert!(matches!(export.samples, SampleBuffer::U16(_)));
    assert_eq!(export.axes.len(), 2);
    assert_eq!(export.axes[0].label, "Pixels");
    assert_eq!(export.axes[1].label, "Wavelength");
    assert!((export.axes[1].data[0] - 206.69).abs() < 0.01);

    // Averaged grabs come back as floats.
    plugin.grab(4).await.expect("averaged grab");
    let export = recv_export(&mut rx).await;
    assert!(matches!(export.samples, SampleBuffer::F64(_)));
    assert_eq!(
        export.metadata.unwrap()["average_count"],
        serde_json::json!(4)
    );

    plugin.stop().await.expect("stop");
    plugin.close().await.expect("close");
    plugin.close().await.expect("second close");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_setting_updates_device_and_descriptors() {
    let settings = Arc::new(Settings::default());
    let mut plugin = MiniSpectroViewer::new();
    plugin
        .initialize(&settings, None)
        .await
        .expect("initialize");

    plugin
        .commit_setting("integration_time_us", SettingValue::Int(250_000))
        .await
        .expect("commit setting");

    let descriptors = plugin.setting_descriptors();
    let integration = descriptors
        .iter()
        .find(|d| d.name == "integration_time_us")
        .unwrap();
    assert_eq!(integration.value.as_i64(), Some(250_000));

    // Unknown settings are logged, not raised.
    plugin
        .commit_setting("not_a_setting", SettingValue::Bool(true))
        .await
        .expect("unknown setting tolerated");

    plugin.close().await.expect("close");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slave_shares_master_controller() {
    let settings = Arc::new(Settings::default());
    let mut master = MiniSpectroViewer::new();
    master
        .initialize(&settings, None)
        .await
        .expect("initialize master");

    let mut slave = MiniSpectroViewer::new();
    let status = slave
        .initialize(&settings, master.controller())
        .await
        .expect("initialize slave");
    assert!(status.initialized);

    let mut rx = slave.data_channel().expect("slave data channel");
    slave.grab(1).await.expect("slave grab");
    let export = recv_export(&mut rx).await;
    assert_eq!(export.samples.len(), 2048);

    // Closing the slave leaves the shared device usable by the master.
    slave.close().await.expect("close slave");
    let mut rx = master.data_channel().expect("master data channel");
    master.grab(1).await.expect("master grab after slave close");
    recv_export(&mut rx).await;

    master.close().await.expect("close master");
}
