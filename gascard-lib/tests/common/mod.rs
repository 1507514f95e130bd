//! Common test utilities: a scripted Gascard on the far end of a duplex pipe.

// Shared across test files; not every item is used in each of them.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gascard_lib::{CodeTable, Gascard, GascardOptions, Mode, SerialConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex, split};
use tokio::time::{MissedTickBehavior, interval};

pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Frame period of the mock, about what a real sensor streams.
pub const MOCK_PERIOD: Duration = Duration::from_millis(100);

/// Options with a timeout comfortably longer than the mock's frame period.
pub fn options() -> GascardOptions {
    GascardOptions {
        serial: SerialConfig {
            timeout_ms: 1000,
            ..SerialConfig::default()
        },
        ..GascardOptions::default()
    }
}

/// Observable state of a mock device.
pub struct MockState {
    catalog: Arc<CodeTable>,
    mode: Mutex<Mode>,
    values: Mutex<HashMap<Mode, Vec<String>>>,
    selects: AtomicUsize,
    writes: Mutex<Vec<String>>,
    /// Stop emitting anything, as if the cable was pulled.
    pub silent: AtomicBool,
}

impl MockState {
    fn new() -> Self {
        let catalog = CodeTable::builtin();
        let mut values = HashMap::new();
        for mode in catalog.modes() {
            let count = catalog.labels(mode).unwrap().len() - 1;
            values.insert(mode, vec!["0".to_string(); count]);
        }
        values.insert(Mode::UserInterface, vec!["1".into(), "CO2".into(), "N2".into(), "1".into()]);
        values.insert(
            Mode::Normal,
            ["1000", "2000", "0.5", "400.5", "25", "1013"].iter().map(|s| s.to_string()).collect(),
        );
        values.insert(
            Mode::Settings,
            ["1.02", "12345", "0", "4", "10", "0"].iter().map(|s| s.to_string()).collect(),
        );
        Self {
            catalog,
            mode: Mutex::new(Mode::UserInterface),
            values: Mutex::new(values),
            selects: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            silent: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock().unwrap()
    }

    /// Number of mode-select commands received.
    pub fn selects(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    /// Field writes received, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    /// Forget the traffic seen so far, such as the handshake.
    pub fn reset_counters(&self) {
        self.selects.store(0, Ordering::SeqCst);
        self.writes.lock().unwrap().clear();
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Current value token of a field.
    pub fn value(&self, field: &str) -> String {
        let spec = self.catalog.field(field).unwrap();
        let labels = self.catalog.labels(spec.mode).unwrap();
        let index = labels.iter().position(|l| l == field).unwrap() - 1;
        self.values.lock().unwrap()[&spec.mode][index].clone()
    }

    fn frame(&self) -> String {
        let mode = self.mode();
        let mut frame = mode.code().to_string();
        if let Some(values) = self.values.lock().unwrap().get(&mode) {
            for value in values {
                frame.push(' ');
                frame.push_str(value);
            }
        }
        frame.push_str("\r\n");
        frame
    }

    /// Apply one received line; returns a frame to send back immediately.
    fn apply(&self, command: &str) -> Option<String> {
        if let Some(mode) = Mode::from_code(command) {
            self.selects.fetch_add(1, Ordering::SeqCst);
            *self.mode.lock().unwrap() = mode;
            return Some(self.frame());
        }

        self.writes.lock().unwrap().push(command.to_string());
        let mode = self.mode();
        let labels = self.catalog.labels(mode).ok()?;
        let spec = self
            .catalog
            .fields_of(mode)
            .into_iter()
            .find(|f| f.code.as_deref().is_some_and(|c| command.starts_with(c)))?;
        let code_len = spec.code.as_deref().map_or(0, str::len);
        let value = &command[code_len..];
        if value.is_empty() {
            // Calibration triggers carry no value.
            return None;
        }
        let index = labels.iter().position(|l| *l == spec.name)? - 1;
        if let Some(values) = self.values.lock().unwrap().get_mut(&mode) {
            values[index] = value.to_string();
        }
        None
    }
}

/// Spawn a mock device streaming one frame per [`MOCK_PERIOD`].
pub fn spawn_mock() -> (DuplexStream, Arc<MockState>) {
    spawn_mock_streaming(MOCK_PERIOD)
}

/// Spawn a mock device streaming one frame per `period`.
pub fn spawn_mock_streaming(period: Duration) -> (DuplexStream, Arc<MockState>) {
    let (client, server) = duplex(PIPE_CAPACITY);
    let state = Arc::new(MockState::new());
    tokio::spawn(run_mock(server, Arc::clone(&state), period));
    (client, state)
}

async fn run_mock(server: DuplexStream, state: Arc<MockState>, period: Duration) {
    let (reader, mut writer) = split(server);
    let mut lines = BufReader::new(reader).lines();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let outgoing = tokio::select! {
            _ = ticker.tick() => Some(state.frame()),
            line = lines.next_line() => match line {
                Ok(Some(command)) => state.apply(command.trim_end()),
                _ => break,
            },
        };
        if let Some(frame) = outgoing {
            if state.silent.load(Ordering::SeqCst) {
                continue;
            }
            if writer.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

/// A connected device backed by a fresh mock; counters start after the handshake.
pub async fn connect_mock(port: &str) -> (Gascard<DuplexStream>, Arc<MockState>) {
    let (stream, state) = spawn_mock();
    let device = Gascard::handshake(stream, port, &options()).await.unwrap();
    state.reset_counters();
    (device, state)
}

/// Install a test subscriber once so `RUST_LOG` shows library traces.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Give the mock a chance to process everything written so far.
pub async fn let_mock_run() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
