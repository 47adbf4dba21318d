use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{Duration, Instant};

/// A point in the connection lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    DnsStart,
    DnsDone,
    ConnectStart,
    ConnectDone,
    ConnAcquired,
    FirstResponseByte,
    BodyReadDone,
}

/// The seven instants captured while a request executes.
///
/// `None` means the point was never reached. Recording an event backfills
/// earlier points that are still unset, so phases the transport skipped
/// (DNS for an IP literal, dialing for a pooled connection) collapse to zero
/// instead of leaving a hole in later subtractions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub tcp_conn_start: Option<Instant>,
    pub tcp_conn_done: Option<Instant>,
    pub got_conn: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub body_read_done: Option<Instant>,
}

impl Timestamps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: Event, at: Instant) {
        match event {
            Event::DnsStart => {
                self.dns_start.get_or_insert(at);
            }
            Event::DnsDone => {
                self.dns_done = Some(at);
                self.dns_start.get_or_insert(at);
            }
            Event::ConnectStart => {
                self.tcp_conn_start = Some(at);
                if self.dns_done.is_none() {
                    // no lookup happened, the target was an address
                    self.dns_done = Some(at);
                    self.dns_start.get_or_insert(at);
                }
            }
            Event::ConnectDone => {
                self.tcp_conn_done = Some(at);
                if self.tcp_conn_start.is_none() {
                    self.dns_start.get_or_insert(at);
                    self.dns_done.get_or_insert(at);
                    self.tcp_conn_start = Some(at);
                }
            }
            Event::ConnAcquired => {
                self.got_conn = Some(at);
                if self.tcp_conn_start.is_none() {
                    // pooled connection
                    self.dns_start.get_or_insert(at);
                    self.dns_done.get_or_insert(at);
                    self.tcp_conn_start = Some(at);
                    self.tcp_conn_done.get_or_insert(at);
                }
            }
            Event::FirstResponseByte => self.first_byte = Some(at),
            Event::BodyReadDone => self.body_read_done = Some(at),
        }
    }

    pub fn dns_lookup(&self) -> Duration {
        span(self.dns_start, self.dns_done)
    }

    pub fn tcp_dialed(&self) -> Duration {
        span(self.tcp_conn_start, self.tcp_conn_done)
    }

    /// From the end of name resolution until a connection is ready to carry
    /// the request.
    pub fn conn_setup(&self) -> Duration {
        span(self.dns_done, self.got_conn)
    }

    pub fn pre_transfer(&self) -> Duration {
        span(self.dns_start, self.got_conn)
    }

    pub fn server_processing(&self) -> Duration {
        span(self.got_conn, self.first_byte)
    }

    pub fn time_to_first_byte(&self) -> Duration {
        span(self.dns_start, self.first_byte)
    }

    pub fn content_transfer(&self) -> Duration {
        span(self.first_byte, self.body_read_done)
    }

    pub fn total(&self) -> Duration {
        span(self.dns_start, self.body_read_done)
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            total: self.total(),
            dns_lookup: self.dns_lookup(),
            tcp_dialed: self.tcp_dialed(),
            conn_setup: self.conn_setup(),
            pre_transfer: self.pre_transfer(),
            time_to_first_byte: self.time_to_first_byte(),
            server_processing: self.server_processing(),
            content_transfer: self.content_transfer(),
        }
    }
}

fn span(start: Option<Instant>, end: Option<Instant>) -> Duration {
    match (start, end) {
        (Some(start), Some(end)) => end.saturating_duration_since(start),
        _ => Duration::ZERO,
    }
}

/// The eight derived durations of one request, read at a single moment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    #[serde(serialize_with = "as_secs")]
    pub total: Duration,
    #[serde(serialize_with = "as_secs")]
    pub dns_lookup: Duration,
    #[serde(serialize_with = "as_secs")]
    pub tcp_dialed: Duration,
    #[serde(serialize_with = "as_secs")]
    pub conn_setup: Duration,
    #[serde(serialize_with = "as_secs")]
    pub pre_transfer: Duration,
    #[serde(rename = "ttfb", serialize_with = "as_secs")]
    pub time_to_first_byte: Duration,
    #[serde(serialize_with = "as_secs")]
    pub server_processing: Duration,
    #[serde(serialize_with = "as_secs")]
    pub content_transfer: Duration,
}

fn as_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{"total":{:.6},"dnsLookup":{:.6}, "tcpDialed":{:.6}, "connSetup":{:.6}, "preTransfer":{:.6}, "ttfb":{:.6}, "serverProcessing":{:.6}, "contentTransfer":{:.6}}}"#,
            self.total.as_secs_f64(),
            self.dns_lookup.as_secs_f64(),
            self.tcp_dialed.as_secs_f64(),
            self.conn_setup.as_secs_f64(),
            self.pre_transfer.as_secs_f64(),
            self.time_to_first_byte.as_secs_f64(),
            self.server_processing.as_secs_f64(),
            self.content_transfer.as_secs_f64(),
        )
    }
}
