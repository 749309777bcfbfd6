use proptest::prelude::*;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use voice_coordinator_lib::audio::devices::{DeviceChangePublisher, DeviceRegistry};
use voice_coordinator_lib::audio::events::{AudioEvent, AudioEventBus, AudioEventKind, ChangeSource, DeviceChangedEvent};
use voice_coordinator_lib::audio::hardware::FakeHardware;
use voice_coordinator_lib::audio::types::{DeviceInfo, DeviceTransport, Direction, RawDevice};

fn raw(id: &str, transport: DeviceTransport) -> RawDevice {
    RawDevice::new(id, format!("{} ({:?})", id, transport), transport)
}

fn output(id: &str) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: format!("{} (Usb)", id),
        direction: Direction::Output,
        is_bluetooth: false,
    }
}

fn harness(native: bool) -> (Arc<FakeHardware>, DeviceChangePublisher, broadcast::Receiver<AudioEvent>) {
    let hw = Arc::new(FakeHardware::new());
    hw.set_native_available(native);
    hw.set_default(Direction::Output, Some(raw("spk-0", DeviceTransport::Usb)));
    hw.set_default(Direction::Input, Some(raw("mic-0", DeviceTransport::BuiltIn)));
    let bus = AudioEventBus::new(128);
    let rx = bus.subscribe();
    let publisher = DeviceChangePublisher::new(Arc::new(DeviceRegistry::new(hw.clone())), bus, None);
    (hw, publisher, rx)
}

fn changes(rx: &mut broadcast::Receiver<AudioEvent>) -> Vec<DeviceChangedEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Some(change) = event.as_device_change() {
            out.push(change.clone());
        }
    }
    out
}

#[cfg(test)]
mod device_change_tests {
    use super::*;

    /// A Bluetooth reconnect that passes through intermediate devices publishes the final one
    #[tokio::test(start_paused = true)]
    async fn test_bluetooth_reconnect_burst_publishes_final_device() {
        let (hw, publisher, mut rx) = harness(true);
        assert!(publisher.start_monitoring(true, true));

        hw.set_default(Direction::Output, Some(raw("speakers", DeviceTransport::BuiltIn)));
        hw.emit_native_change(Direction::Output);
        tokio::time::sleep(Duration::from_millis(150)).await;
        hw.set_default(Direction::Output, Some(raw("AirPods Pro", DeviceTransport::Bluetooth)));
        hw.emit_native_change(Direction::Output);
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        let published = changes(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].device_id, "AirPods Pro");
        assert!(published[0].is_bluetooth);
        assert_eq!(published[0].old_device_id.as_deref(), Some("spk-0"));
        assert_eq!(publisher.get_current_output_device().map(|d| d.id).as_deref(), Some("AirPods Pro"));
    }

    /// Without a native source the polling loop alone still detects the change
    #[tokio::test(start_paused = true)]
    async fn test_polling_fallback_detects_change() {
        let (hw, publisher, mut rx) = harness(false);
        publisher.start_monitoring(false, true);
        assert!(!publisher.is_native_source_available());

        let started = rx.recv().await.unwrap();
        assert!(matches!(
            started.kind,
            AudioEventKind::MonitoringStarted(ref e) if e.source == ChangeSource::Polling
        ));

        hw.set_default(Direction::Output, Some(raw("hdmi", DeviceTransport::Unknown)));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let published = changes(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].source, ChangeSource::Polling);
        assert!(publisher.get_stats().polling_cycles >= 1);
    }

    /// Default-device query errors during polling are counted and do not stop monitoring
    #[tokio::test(start_paused = true)]
    async fn test_polling_survives_query_errors() {
        let (hw, publisher, mut rx) = harness(false);
        publisher.start_monitoring(true, false);

        hw.set_default_query_error(Some(voice_coordinator_lib::audio::HardwareError::internal("host busy")));
        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert!(publisher.get_stats().polling_errors >= 2);

        hw.set_default_query_error(None);
        hw.set_default(Direction::Input, Some(raw("mic-1", DeviceTransport::Usb)));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let published = changes(&mut rx);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].direction, Direction::Input);
        assert_eq!(published[0].device_id, "mic-1");
    }

    /// Verbose device logging does not change what gets published
    #[tokio::test(start_paused = true)]
    #[serial]
    async fn test_publishing_with_audio_debug_enabled() {
        voice_coordinator_lib::log::set_audio_debug(true);
        let (hw, publisher, mut rx) = harness(true);
        publisher.start_monitoring(true, true);

        hw.set_default(Direction::Input, Some(raw("mic-1", DeviceTransport::Usb)));
        hw.emit_native_change(Direction::Input);
        tokio::time::sleep(Duration::from_millis(400)).await;
        voice_coordinator_lib::log::set_audio_debug(false);

        assert_eq!(changes(&mut rx).len(), 1);
    }

    #[derive(Debug, Clone)]
    struct Observation {
        gap_ms: u64,
        device: usize,
        native: bool,
    }

    fn observation() -> impl Strategy<Value = Observation> {
        (0u64..40, 0usize..3, any::<bool>()).prop_map(|(gap_ms, device, native)| Observation {
            gap_ms,
            device,
            native,
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any interleaving of native and polling observations inside one debounce window
        /// publishes at most one change, carrying the last observed device
        #[test]
        fn test_interleaved_sources_publish_once(observations in prop::collection::vec(observation(), 1..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let (_hw, publisher, mut rx) = harness(true);
                publisher.start_monitoring(false, true);

                for step in &observations {
                    tokio::time::sleep(Duration::from_millis(step.gap_ms)).await;
                    let source = if step.native { ChangeSource::Native } else { ChangeSource::Polling };
                    publisher.ingest(Direction::Output, Some(output(&format!("spk-{}", step.device))), source);
                }
                tokio::time::sleep(Duration::from_millis(400)).await;

                let final_device = format!("spk-{}", observations[observations.len() - 1].device);
                let published = changes(&mut rx);
                if final_device == "spk-0" {
                    assert!(published.is_empty());
                } else {
                    assert_eq!(published.len(), 1);
                    assert_eq!(published[0].device_id, final_device);
                    assert_eq!(published[0].old_device_id.as_deref(), Some("spk-0"));
                }
                publisher.stop_monitoring();
            });
        }
    }
}
