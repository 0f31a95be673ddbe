#[cfg(test)]
mod tests {
    use crate::configuration::types::{BackendKind, CaptureSettings, EvictionPolicy};
    use crate::data_capture::capture_source::mock::{MockBackend, MockHandle};
    use crate::data_capture::capture_source::{CaptureSource, KernelTraceSource};
    use crate::data_capture::types::{CaptureVariant, TraceEvent, TraceEventKind};
    use crate::data_capture::{OpenOptions, TraceTranslator};
    use crate::error_handling::types::{CaptureError, MonitorError};
    use crate::flow_tracking::types::Snapshot;
    use crate::flow_tracking::ConnectionManager;
    use crate::geolocation::NullResolver;
    use crate::monitor::{capture_source_from_settings, EngineTiming, Monitor, SnapshotSink};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    struct RecordingSink {
        published: Arc<Mutex<Vec<(Uuid, usize)>>>,
    }

    impl SnapshotSink for RecordingSink {
        fn publish(&mut self, session_id: Uuid, snapshot: &Snapshot) {
            self.published
                .lock()
                .unwrap()
                .push((session_id, snapshot.flows.len()));
        }
    }

    fn timing(channel_capacity: usize) -> EngineTiming {
        EngineTiming {
            merge_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(3),
            connection_timeout: Duration::from_secs(3),
            channel_capacity,
        }
    }

    fn monitor(threshold: u64, channel_capacity: usize) -> Monitor {
        let manager = ConnectionManager::new(threshold, EvictionPolicy::Remove, Arc::new(NullResolver));
        Monitor::new(Arc::new(manager), timing(channel_capacity))
    }

    fn trace_source(backend: MockBackend<TraceEvent>) -> Box<dyn CaptureSource> {
        Box::new(KernelTraceSource::kernel_trace(
            backend,
            TraceTranslator::new(3074, None),
            OpenOptions::default(),
        ))
    }

    fn mock_source() -> (Box<dyn CaptureSource>, MockHandle<TraceEvent>) {
        let (backend, handle) = MockBackend::new();
        (trace_source(backend), handle)
    }

    fn recv_event(last_octet: u8, size: u32) -> TraceEvent {
        TraceEvent {
            kind: TraceEventKind::Recv,
            local: SocketAddr::from(([192, 168, 1, 10], 3074)),
            remote: SocketAddr::from(([203, 0, 113, last_octet], 3074)),
            size,
            pid: 4242,
        }
    }

    #[tokio::test]
    async fn test_start_without_source() {
        let mut monitor = monitor(0, 16);
        let err = assert_err!(monitor.start_monitoring().await);
        assert!(matches!(err, MonitorError::NoCaptureSource));
        assert!(!monitor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshots_follow_merge_and_eviction() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut monitor = monitor(1024, 64);
        let (source, handle) = mock_source();
        assert_ok!(monitor.select_source(source));
        let mut snapshots = monitor.subscribe();

        let session = assert_ok!(monitor.start_monitoring().await);
        assert_eq!(monitor.session_id(), Some(session));

        assert!(handle.emit(recv_event(7, 1000)));
        assert!(handle.emit(recv_event(7, 25)));
        assert!(handle.emit(recv_event(8, 10)));

        // first refresh: peer 7 crossed the threshold, peer 8 did not
        let first = snapshots.recv().await.unwrap();
        assert_eq!(first.flows.len(), 1);
        assert_eq!(first.flows[0].remote_identifier, "192.168.1.10:3074-203.0.113.7:3074");
        assert_eq!(first.flows[0].formatted_traffic, "1 KB");
        assert_eq!(monitor.manager().flow_count(), 2);

        // no more traffic: both flows are older than the timeout at the second refresh
        let second = snapshots.recv().await.unwrap();
        assert!(second.flows.is_empty());
        assert_eq!(monitor.manager().flow_count(), 0);

        let stats = monitor.capture_stats().unwrap();
        assert_eq!((stats.observed, stats.accepted), (3, 3));

        assert_ok!(monitor.stop_monitoring().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_ordered_and_idempotent() {
        let mut monitor = monitor(0, 64);
        let (source, handle) = mock_source();
        assert_ok!(monitor.select_source(source));

        assert_ok!(monitor.start_monitoring().await);
        handle.emit(recv_event(9, 100));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(monitor.manager().flow_count(), 1);

        assert_ok!(monitor.stop_monitoring().await);
        assert!(!monitor.is_running());
        assert_eq!(
            handle.calls(),
            vec!["open", "register", "start", "unregister", "stop", "close"]
        );
        assert_eq!(monitor.manager().flow_count(), 0);
        assert!(!handle.emit(recv_event(9, 100)));

        assert_ok!(monitor.stop_monitoring().await);
        assert_eq!(handle.calls().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_leaves_nothing_running() {
        let mut monitor = monitor(0, 64);
        let (mut backend, handle) = MockBackend::new();
        backend.fail_on = Some("register");
        assert_ok!(monitor.select_source(trace_source(backend)));

        let err = assert_err!(monitor.start_monitoring().await);
        assert!(matches!(err, MonitorError::CaptureError(CaptureError::DeviceError(_))));
        assert!(!monitor.is_running());
        assert_eq!(handle.calls(), vec!["open", "register", "close"]);

        // a permission failure is surfaced before the device is touched
        let (mut backend, handle) = MockBackend::new();
        backend.deny_privileges = true;
        assert_ok!(monitor.select_source(trace_source(backend)));
        let err = assert_err!(monitor.start_monitoring().await);
        assert!(matches!(err, MonitorError::CaptureError(CaptureError::PermissionError(_))));
        assert!(handle.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_session_rejects_changes() {
        let mut monitor = monitor(0, 64);
        let (source, _handle) = mock_source();
        assert_ok!(monitor.select_source(source));
        assert_ok!(monitor.start_monitoring().await);

        let (other, _other_handle) = mock_source();
        assert!(matches!(monitor.select_source(other), Err(MonitorError::AlreadyRunning)));
        assert!(matches!(monitor.start_monitoring().await, Err(MonitorError::AlreadyRunning)));

        assert_ok!(monitor.stop_monitoring().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_drops_updates() {
        let mut monitor = monitor(0, 1);
        let (source, handle) = mock_source();
        assert_ok!(monitor.select_source(source));
        assert_ok!(monitor.start_monitoring().await);

        // the engine task has not been polled yet, so the channel of one fills up
        for _ in 0..3 {
            handle.emit(recv_event(10, 50));
        }
        let stats = monitor.capture_stats().unwrap();
        assert_eq!((stats.accepted, stats.dropped), (1, 2));

        assert_ok!(monitor.stop_monitoring().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sinks_survive_restart() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let mut monitor = monitor(0, 64);
        monitor.add_sink(Box::new(RecordingSink {
            published: Arc::clone(&published),
        }));
        let (source, handle) = mock_source();
        assert_ok!(monitor.select_source(source));

        let first = assert_ok!(monitor.start_monitoring().await);
        handle.emit(recv_event(11, 10));
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_ok!(monitor.stop_monitoring().await);

        let second = assert_ok!(monitor.start_monitoring().await);
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert_ok!(monitor.stop_monitoring().await);

        assert_ne!(first, second);
        assert_eq!(*published.lock().unwrap(), vec![(first, 1), (second, 0)]);
    }

    #[test]
    fn test_source_from_settings() {
        let mut settings = CaptureSettings::default();
        assert!(matches!(
            capture_source_from_settings(&settings, None),
            Err(MonitorError::NoCaptureSource)
        ));

        settings.source = Some("capture.pcap".to_string());
        let source = capture_source_from_settings(&settings, None).unwrap();
        assert_eq!(source.variant(), CaptureVariant::PacketCapture);
        assert_eq!(source.name(), "pcap:capture.pcap");

        settings.backend = BackendKind::TraceFeed;
        settings.source = Some("-".to_string());
        let source = capture_source_from_settings(&settings, Some(4242)).unwrap();
        assert_eq!(source.variant(), CaptureVariant::KernelTrace);
        assert!(!source.is_running());
    }
}
