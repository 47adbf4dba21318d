use crate::timing::{Event, Metrics, Timestamps};
use http::Request;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle recording the lifecycle timings of one request.
///
/// The transport calls the `on_*` hooks from whatever task drives the
/// connection while the caller keeps a clone to read the durations. All
/// clones share one record.
#[derive(Debug, Default, Clone)]
pub struct Tracer {
    inner: Arc<Mutex<Timestamps>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tracer attached to `req` by [`instrument`], if any.
    pub fn from_request<B>(req: &Request<B>) -> Option<Tracer> {
        req.extensions().get::<Tracer>().cloned()
    }

    pub fn record(&self, event: Event, at: Instant) {
        trace!("timing event {:?}", event);
        self.inner.lock().record(event, at);
    }

    pub fn on_dns_start(&self) {
        self.record(Event::DnsStart, Instant::now());
    }

    pub fn on_dns_done(&self) {
        self.record(Event::DnsDone, Instant::now());
    }

    pub fn on_connect_start(&self) {
        self.record(Event::ConnectStart, Instant::now());
    }

    pub fn on_connect_done(&self) {
        self.record(Event::ConnectDone, Instant::now());
    }

    pub fn on_conn_acquired(&self) {
        self.record(Event::ConnAcquired, Instant::now());
    }

    pub fn on_first_response_byte(&self) {
        self.record(Event::FirstResponseByte, Instant::now());
    }

    /// Marks the response body as fully read. Call once, after the body was
    /// consumed; until then `content_transfer` and `total` read zero.
    pub fn finish(&self) {
        self.record(Event::BodyReadDone, Instant::now());
    }

    pub fn timestamps(&self) -> Timestamps {
        *self.inner.lock()
    }

    /// All eight durations read under one lock.
    pub fn metrics(&self) -> Metrics {
        self.inner.lock().metrics()
    }

    pub fn dns_lookup(&self) -> Duration {
        self.inner.lock().dns_lookup()
    }

    pub fn tcp_dialed(&self) -> Duration {
        self.inner.lock().tcp_dialed()
    }

    pub fn conn_setup(&self) -> Duration {
        self.inner.lock().conn_setup()
    }

    pub fn pre_transfer(&self) -> Duration {
        self.inner.lock().pre_transfer()
    }

    pub fn server_processing(&self) -> Duration {
        self.inner.lock().server_processing()
    }

    pub fn time_to_first_byte(&self) -> Duration {
        self.inner.lock().time_to_first_byte()
    }

    pub fn content_transfer(&self) -> Duration {
        self.inner.lock().content_transfer()
    }

    pub fn total(&self) -> Duration {
        self.inner.lock().total()
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.metrics(), f)
    }
}

/// Attaches a fresh [`Tracer`] to `req` so a traced transport fires its hooks
/// while executing it. The returned tracer shares its record with the one
/// stored in the request.
pub fn instrument<B>(mut req: Request<B>) -> (Request<B>, Tracer) {
    let tracer = Tracer::new();
    req.extensions_mut().insert(tracer.clone());
    (req, tracer)
}

/// Like [`instrument`], but an absent request stays absent and comes back
/// with an unused tracer whose metrics are all zero.
pub fn instrument_opt<B>(req: Option<Request<B>>) -> (Option<Request<B>>, Tracer) {
    match req {
        Some(req) => {
            let (req, tracer) = instrument(req);
            (Some(req), tracer)
        }
        None => (None, Tracer::new()),
    }
}
