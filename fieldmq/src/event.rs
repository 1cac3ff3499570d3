use std::fmt;

use tokio::sync::mpsc;

/// Connection lifecycle state, owned by the manager task.
///
/// Advances only in declaration order, falls back on failure, never skips
/// forward. Other contexts observe it through `IoEvent::StateChange` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    LoadConfig,
    Initialize,
    WaitServer,
    Connecting,
    Subscribing,
    Ready,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::LoadConfig => "LoadConfig",
            ConnState::Initialize => "Initialize",
            ConnState::WaitServer => "WaitServer",
            ConnState::Connecting => "Connecting",
            ConnState::Subscribing => "Subscribing",
            ConnState::Ready => "Ready",
            ConnState::Disconnecting => "Disconnecting",
            ConnState::Disconnected => "Disconnected",
        };
        f.write_str(s)
    }
}

/// Outcome of one field write, reported through `IoEvent::WriteResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    FieldNotFound,
    ValueRejected,
    LostConnection,
    Timeout,
}

/// Events flowing from the driver facade to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    FieldWrite { field: String, value: String },
    Reload,
}

/// Events flowing from the connection manager to the driver facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    NewValue { field: String, value: String },
    BadValue { field: String },
    WriteResult { field: String, status: WriteStatus },
    StateChange(ConnState),
}

/// Bounded event channel endpoint that never blocks the producer.
///
/// On overflow the event is dropped and logged; the consumer side is plain
/// `mpsc::Receiver`.
#[derive(Clone)]
pub struct EventSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T: fmt::Debug> EventSender<T> {
    #[inline]
    pub fn emit(&self, ev: T) {
        match self.tx.try_send(ev) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                log::warn!("{} queue full, dropping event {ev:?}", self.name);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("{} queue closed", self.name);
            }
        }
    }
}

pub fn channel<T>(name: &'static str, cap: usize) -> (EventSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(cap);
    (EventSender { name, tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overflow_drops_newest() {
        let (tx, mut rx) = channel("test", 2);
        tx.emit(IoEvent::StateChange(ConnState::LoadConfig));
        tx.emit(IoEvent::StateChange(ConnState::Initialize));
        tx.emit(IoEvent::StateChange(ConnState::WaitServer)); // dropped

        assert_eq!(rx.recv().await, Some(IoEvent::StateChange(ConnState::LoadConfig)));
        assert_eq!(rx.recv().await, Some(IoEvent::StateChange(ConnState::Initialize)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_after_close() {
        let (tx, rx) = channel("test", 1);
        drop(rx);
        tx.emit(DriverEvent::Reload); // no panic
    }
}
