#![deny(unsafe_code)]

//! MQTT 3.1.1 client engine bridging named, typed data points ("fields") of a
//! home-automation platform to broker topics.
//!
//! The engine subscribes to the topics of read-capable fields, publishes on
//! field writes, tracks acknowledgements and keeps the connection alive,
//! recovering automatically from broker and network failures.
//!
//! Two halves cooperate: the [`Facade`] lives on the platform side and never
//! blocks beyond a bounded write wait, while one background task (the
//! connection manager) owns the socket and drives the lifecycle
//! `LoadConfig -> Initialize -> WaitServer -> Connecting -> Subscribing ->
//! Ready`. The halves exchange events over two bounded queues.
//!
//! ```no_run
//! use fieldmq::{Engine, FileSource, IoEvent};
//!
//! # async fn run() {
//! let mut facade = Engine::start(FileSource::new("fieldmq.toml"));
//! loop {
//!     for ev in facade.poll() {
//!         if let IoEvent::NewValue { field, value } = ev {
//!             println!("{field} = {value}");
//!         }
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//! }
//! # }
//! ```

mod facade;
mod manager;
mod transport;

pub mod binding;
pub mod error;
pub mod event;
pub mod settings;
pub mod value;

pub use binding::{BindingTable, Direction, FieldBinding, FieldDef, FieldKind};
pub use error::EngineError;
pub use event::{ConnState, DriverEvent, IoEvent, WriteStatus};
pub use facade::{Engine, Facade, RELOAD_FIELD};
pub use settings::{ConfigSource, FileSource, ServerAddr, Settings, StaticSource};
pub use value::{Decoded, ValueCodec, ValueError};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
