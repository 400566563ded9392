//! BirdEdge daemon.
//!
//! Supervises the audio classification worker: keeps its source list in
//! sync with the stations announced over mDNS, restarts it (rate limited)
//! whenever that list changes, and routes the worker's output to logs and
//! telemetry sinks.
//!
//! Data flow:
//!
//! ```text
//! mDNS ──► discovery ──► supervisor ──► registry ──► render ──► worker
//!                            ▲                                    │
//!                            └──── protocol (line router) ◄───────┘
//!                                        │
//!                                        ▼
//!                                sink (InfluxDB, ZMQ PUB)
//! ```

pub mod discovery;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod render;
pub mod sink;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

pub use discovery::{Discovery, DiscoveryEvent};
pub use protocol::{Event, OutputRouter};
pub use registry::{Source, SourceRegistry};
pub use render::{ConfigRenderer, IniDocument};
pub use sink::{BusSink, FanoutSink, InfluxSink, PublishSink};
pub use supervisor::{Supervisor, SupervisorSettings, WorkerState};
pub use worker::{CommandLauncher, Launcher, WorkerEvent, WorkerHandle};
