//! DVB tuning, service routing and transport-stream remultiplexing.
//!
//! This crate drives DVB adapters, walks a broadcast network to build a
//! service catalog, and serves per-service single-program transport streams
//! to any number of concurrent readers.
//!
//! # Pipeline
//!
//! ```text
//! seed transponders -> Scanner -> Catalog (XML persisted)
//!                                    |
//! client asks for a service by name  v
//!   DvbDevice -> Frontend (tune) -> Demux (PID whitelist) -> DVR
//!                                    |
//!                                  Remux  (one reader thread per DVR)
//!                                    |
//!                        per-service packet queue + synthesized PAT
//!                                    |
//!                          ServiceStream (blocking byte reads)
//! ```
//!
//! The external file-tree server links against [`bridge::StreamLookup`];
//! everything above the byte stream (catalog queries, the file protocol,
//! the decoding client) lives outside this crate.

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod demux;
pub mod device;
pub mod error;
pub mod frontend;
pub mod hw;
pub mod logging;
pub mod model;
pub mod psi;
pub mod remux;
pub mod scan;

pub use bridge::StreamLookup;
pub use device::{DeviceConfig, DvbDevice};
pub use error::{DvbError, Result};
pub use model::catalog::Catalog;
pub use model::service::{ElementaryStream, RunningStatus, Service, ServiceType};
pub use model::transponder::{DeliverySystem, Transponder, TuningParams};
pub use remux::stream::ServiceStream;
