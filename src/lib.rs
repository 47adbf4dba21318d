#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate tracing;

pub mod app;
pub mod cli;
pub mod http;
pub mod timing;
pub mod tls;

pub use crate::http::tracer::{instrument, instrument_opt, Tracer};
pub use crate::http::transport::{Transport, TransportConfig};
pub use crate::timing::{Event, Metrics, Timestamps};
