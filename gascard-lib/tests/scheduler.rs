mod common;

use std::time::Duration;

use common::{connect_mock, options};
use gascard_lib::{
    Control, CsvSink, FieldValue, GascardError, MemorySink, Registry, Reply, SampleBatch, SampleSink, Scheduler,
    SchedulerConfig, SinkError, SqliteSink, WriteMode,
};
use tokio::io::DuplexStream;
use tokio::time::sleep;

async fn two_devices() -> Registry<DuplexStream> {
    let mut registry = Registry::new(options());
    for name in ["a", "b"] {
        let (device, _state) = connect_mock(name).await;
        registry.adopt(name, device).unwrap();
    }
    registry
}

fn config(rate_hz: f64, duration_s: Option<u64>) -> SchedulerConfig {
    SchedulerConfig {
        rate_hz,
        duration: duration_s.map(Duration::from_secs),
        fields: vec!["Conc 1".to_string(), "Sensor Temp".to_string()],
        ..SchedulerConfig::default()
    }
}

struct FailingSink {
    error: fn() -> SinkError,
}

impl SampleSink for FailingSink {
    fn persist(&mut self, _batch: &SampleBatch) -> Result<(), SinkError> {
        Err((self.error)())
    }
}

#[tokio::test(start_paused = true)]
async fn test_runs_for_duration() {
    let sink = MemorySink::new();
    let handle = Scheduler::start(two_devices().await, sink.clone(), config(2.0, Some(3))).unwrap();
    let report = handle.join().await.unwrap();

    assert_eq!(report.ticks, 6);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.failed_reads, 0);
    assert!(report.error.is_none());
    assert_eq!(report.registry.len(), 2);

    let batches = sink.batches();
    assert_eq!(batches.len(), 6);
    assert_eq!(batches.iter().map(|b| b.tick).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
    for batch in &batches {
        let devices: Vec<&str> = batch.rows.iter().map(|r| r.device.as_str()).collect();
        assert_eq!(devices, vec!["a", "b"]);
        for row in &batch.rows {
            assert_eq!(row.timestamp, row.request_sent + (row.response_received - row.request_sent) / 2);
            assert_eq!(row.record.names().collect::<Vec<_>>(), vec!["Conc 1", "Sensor Temp"]);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_the_loop() {
    let sink = MemorySink::new();
    let handle = Scheduler::start(two_devices().await, sink.clone(), config(2.0, None)).unwrap();
    sleep(Duration::from_millis(1200)).await;
    handle.stop();

    let report = handle.join().await.unwrap();
    assert!(report.ticks >= 2);
    assert_eq!(sink.batches().len() as u64, report.ticks);
    assert_eq!(report.registry.names(), vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_command_ends_without_a_reply() {
    let mut handle = Scheduler::start(two_devices().await, MemorySink::new(), config(2.0, None)).unwrap();
    let err = handle.request(Control::Stop).await.unwrap_err();
    assert!(matches!(err, GascardError::Closed));

    let report = handle.join().await.unwrap();
    assert_eq!(report.ticks, 0);
    assert!(report.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_services_commands_between_ticks() {
    let handle = Scheduler::start(two_devices().await, MemorySink::new(), config(4.0, None));
    let mut handle = handle.unwrap();

    let reply = handle
        .request(Control::Set {
            assignments: vec![("Time Constant".to_string(), FieldValue::from(7))],
            devices: Some(vec!["a".to_string()]),
        })
        .await
        .unwrap();
    match reply {
        Reply::Outcomes(outcomes) => {
            assert_eq!(outcomes.len(), 1);
            assert!(outcomes["a"].is_ok());
        }
        other => panic!("Expected outcomes, got {:?}", other),
    }

    let reply = handle
        .request(Control::Get {
            fields: vec!["Time Constant".to_string()],
            devices: None,
        })
        .await
        .unwrap();
    match reply {
        Reply::Readings(readings) => {
            let a = readings["a"].as_ref().unwrap();
            let b = readings["b"].as_ref().unwrap();
            assert_eq!(a.record.get("Time Constant"), Some(&FieldValue::Number(7.0)));
            assert_eq!(b.record.get("Time Constant"), Some(&FieldValue::Number(10.0)));
        }
        other => panic!("Expected readings, got {:?}", other),
    }

    let reply = handle
        .request(Control::Run(Box::new(|registry: &mut Registry<DuplexStream>| Reply::Custom(Box::new(registry.names())))))
        .await
        .unwrap();
    match reply {
        Reply::Custom(value) => {
            let names = value.downcast::<Vec<String>>().unwrap();
            assert_eq!(*names, vec!["a", "b"]);
        }
        other => panic!("Expected custom reply, got {:?}", other),
    }

    let reply = handle.request(Control::Span { fraction: 2.0, devices: None }).await.unwrap();
    assert!(matches!(reply, Reply::Failed(GascardError::OutOfRange { .. })));

    handle.stop();
    let report = handle.join().await.unwrap();
    assert!(report.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_skips_ticks_when_falling_behind() {
    // Each read waits for the next frame, far longer than a 20 ms period.
    let sink = MemorySink::new();
    let handle = Scheduler::start(two_devices().await, sink.clone(), config(50.0, Some(1))).unwrap();
    let report = handle.join().await.unwrap();

    assert!(report.skipped > 0);
    assert!(report.ticks < 20, "burst detected: {} ticks", report.ticks);
    let ticks: Vec<u64> = sink.batches().iter().map(|b| b.tick).collect();
    assert!(ticks.windows(2).all(|w| w[1] > w[0]));
}

#[tokio::test(start_paused = true)]
async fn test_device_failures_do_not_stop_sampling() {
    let mut registry = Registry::new(options());
    let (device, _) = connect_mock("a").await;
    registry.adopt("a", device).unwrap();
    let (device, quiet) = connect_mock("b").await;
    registry.adopt("b", device).unwrap();
    quiet.set_silent(true);

    let sink = MemorySink::new();
    let handle = Scheduler::start(registry, sink.clone(), config(0.5, Some(6))).unwrap();
    let report = handle.join().await.unwrap();

    assert_eq!(report.ticks, 3);
    assert_eq!(report.failed_reads, 3);
    for batch in sink.batches() {
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].device, "a");
    }
}

#[tokio::test(start_paused = true)]
async fn test_fatal_sink_error_stops_the_loop() {
    let sink = FailingSink {
        error: || SinkError::Io(std::io::Error::other("disk unplugged")),
    };
    let handle = Scheduler::start(two_devices().await, sink, config(2.0, Some(5))).unwrap();
    let report = handle.join().await.unwrap();

    assert_eq!(report.ticks, 1);
    assert!(matches!(report.error, Some(SinkError::Io(_))));
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_sink_error_is_only_logged() {
    let sink = FailingSink {
        error: || SinkError::Rejected("bad batch".into()),
    };
    let handle = Scheduler::start(two_devices().await, sink, config(2.0, Some(2))).unwrap();
    let report = handle.join().await.unwrap();

    assert_eq!(report.ticks, 4);
    assert!(report.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_asynchronous_writes_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.sqlite");
    let sink = SqliteSink::open(&path).unwrap();

    let config = SchedulerConfig {
        write_mode: WriteMode::Asynchronous,
        ..config(2.0, Some(2))
    };
    let handle = Scheduler::start(two_devices().await, sink, config).unwrap();
    let report = handle.join().await.unwrap();
    assert!(report.ticks > 0);
    assert!(report.error.is_none());

    let conn = rusqlite::Connection::open(&path).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM samples", [], |r| r.get(0))
        .unwrap();
    assert_eq!(rows as u64, 2 * report.ticks - report.failed_reads);
    let devices: i64 = conn
        .query_row("SELECT COUNT(DISTINCT device) FROM samples", [], |r| r.get(0))
        .unwrap();
    assert_eq!(devices, 2);
    let conc: f64 = conn
        .query_row("SELECT \"Conc 1\" FROM samples WHERE device = 'a' LIMIT 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(conc, 400.5);
}

#[tokio::test(start_paused = true)]
async fn test_asynchronous_writes_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("samples.csv");
    let sink = CsvSink::create(&path).unwrap();

    let config = SchedulerConfig {
        write_mode: WriteMode::Asynchronous,
        ..config(2.0, Some(1))
    };
    let report = Scheduler::start(two_devices().await, sink, config)
        .unwrap()
        .join()
        .await
        .unwrap();
    assert!(report.error.is_none());

    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("timestamp,device,request_sent,response_received,Conc 1,Sensor Temp")
    );
    let first = lines.next().unwrap();
    assert!(first.contains(",a,"));
    assert!(first.ends_with(",400.5,25"));
}

#[tokio::test(start_paused = true)]
async fn test_rejects_unknown_target_and_bad_rate() {
    let config = SchedulerConfig {
        devices: Some(vec!["ghost".to_string()]),
        ..config(1.0, None)
    };
    let err = Scheduler::start(two_devices().await, MemorySink::new(), config).err().unwrap();
    assert!(matches!(err, GascardError::UnknownDevice(name) if name == "ghost"));

    let err = Scheduler::start(two_devices().await, MemorySink::new(), config_with_rate(0.0))
        .err()
        .unwrap();
    assert!(matches!(err, GascardError::Config(_)));
}

fn config_with_rate(rate_hz: f64) -> SchedulerConfig {
    SchedulerConfig {
        rate_hz,
        ..SchedulerConfig::default()
    }
}
