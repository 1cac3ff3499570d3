use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::binding::{FieldDef, FieldKind};
use crate::error::EngineError;
use crate::event::{self, ConnState, DriverEvent, EventSender, IoEvent, WriteStatus};
use crate::manager::Manager;
use crate::settings::ConfigSource;
use crate::value::{Decoded, ValueCodec};

/// Synthetic writable boolean field; writing a truthy value restarts the
/// lifecycle from configuration load.
pub const RELOAD_FIELD: &str = "Engine.Reload";

/// How long a write waits for its result before giving up.
const WRITE_WAIT: Duration = Duration::from_secs(5);

const DRIVER_QUEUE_CAP: usize = 64;
const IO_QUEUE_CAP: usize = 256;

pub struct Engine;

impl Engine {
    /// Spawn the connection manager task and return the driver-facing handle.
    /// Must be called within a tokio runtime.
    pub fn start(source: impl ConfigSource + 'static) -> Facade {
        let (driver_tx, driver_rx) = event::channel("driver-event", DRIVER_QUEUE_CAP);
        let (io_tx, io_rx) = event::channel("io-event", IO_QUEUE_CAP);
        let defs = Arc::new(RwLock::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let manager = Manager::new(Box::new(source), driver_rx, io_tx, defs.clone(), stop.clone());
        let handle = tokio::spawn(manager.run());

        Facade {
            driver_tx,
            io_rx,
            pending: VecDeque::new(),
            values: HashMap::new(),
            state: ConnState::LoadConfig,
            defs,
            stop,
            handle: Some(handle),
        }
    }
}

/// The driver-facing side of the engine.
///
/// Owns the current field values, drains I/O events without blocking, and
/// performs writes with a bounded, interruptible wait for their outcome.
pub struct Facade {
    driver_tx: EventSender<DriverEvent>,
    io_rx: mpsc::Receiver<IoEvent>,
    pending: VecDeque<IoEvent>,
    values: HashMap<String, String>,
    state: ConnState,
    defs: Arc<RwLock<Option<Vec<FieldDef>>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), EngineError>>>,
}

impl Facade {
    /// Drain all queued I/O events without blocking.
    pub fn poll(&mut self) -> Vec<IoEvent> {
        let mut events: Vec<IoEvent> = self.pending.drain(..).collect();
        while let Ok(ev) = self.io_rx.try_recv() {
            self.apply(&ev);
            events.push(ev);
        }
        events
    }

    /// Last observed connection state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Last received value of a field, if any arrived this session.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    /// Field definitions for the current configuration, reported once per
    /// connection cycle right after the engine reaches Ready.
    pub fn take_definitions(&mut self) -> Option<Vec<FieldDef>> {
        self.defs.write().take().map(|mut defs| {
            defs.push(FieldDef { name: RELOAD_FIELD.into(), kind: FieldKind::Bool, writable: true });
            defs
        })
    }

    /// Write a field value and wait (bounded) for the outcome.
    ///
    /// The wait is interrupted early when the connection state leaves Ready;
    /// events for other fields observed meanwhile are kept for the next
    /// `poll`.
    pub async fn write_field(&mut self, field: &str, value: &str) -> WriteStatus {
        if field == RELOAD_FIELD {
            return self.write_reload(value);
        }
        if self.state != ConnState::Ready {
            return WriteStatus::LostConnection;
        }
        self.driver_tx.emit(DriverEvent::FieldWrite { field: field.into(), value: value.into() });

        let deadline = Instant::now() + WRITE_WAIT;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(r) if !r.is_zero() => r,
                _ => return WriteStatus::Timeout,
            };
            let ev = match tokio::time::timeout(remaining, self.io_rx.recv()).await {
                Ok(Some(ev)) => ev,
                Ok(None) => return WriteStatus::LostConnection,
                Err(_) => return WriteStatus::Timeout,
            };
            self.apply(&ev);
            match ev {
                IoEvent::WriteResult { field: f, status } if f == field => return status,
                IoEvent::StateChange(state) if state != ConnState::Ready => {
                    self.pending.push_back(IoEvent::StateChange(state));
                    return WriteStatus::LostConnection;
                }
                other => self.pending.push_back(other),
            }
        }
    }

    /// Cooperative shutdown: request the stop, then wait for the manager task
    /// to run its Disconnecting/Disconnected tail.
    pub async fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("engine stopped with error, {e}"),
                Err(e) => log::error!("engine task panicked, {e}"),
            }
        }
    }

    fn write_reload(&mut self, value: &str) -> WriteStatus {
        let codec = ValueCodec::Bool { on: "1".into(), off: "0".into() };
        match codec.decode(value.as_bytes()) {
            Decoded::Value(v) if v == "True" => {
                self.driver_tx.emit(DriverEvent::Reload);
                WriteStatus::Success
            }
            Decoded::Value(_) => WriteStatus::Success,
            _ => WriteStatus::ValueRejected,
        }
    }

    fn apply(&mut self, ev: &IoEvent) {
        match ev {
            IoEvent::StateChange(state) => self.state = *state,
            IoEvent::NewValue { field, value } => {
                self.values.insert(field.clone(), value.clone());
            }
            // a rejected payload invalidates the cached value; the field reads
            // as absent until a good value arrives
            IoEvent::BadValue { field } => {
                self.values.remove(field);
            }
            IoEvent::WriteResult { .. } => {}
        }
    }
}
