use crate::http::dns_resolver::DnsResolver;
use crate::http::first_byte::{FirstByteSlot, FirstByteStream};
use crate::http::tracer::Tracer;
use crate::tls;
use anyhow::Context;
use bytes::Bytes;
use http::header::HOST;
use http::uri::PathAndQuery;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::Full;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

const IDLE_READY_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-address bound on dialing, also applied to the TLS handshake.
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Keep connections around for later requests to the same origin.
    pub pool_idle: bool,
    pub insecure: bool,
    pub ca_file: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            pool_idle: true,
            insecure: false,
            ca_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl PoolKey {
    fn from_uri(uri: &Uri) -> Result<Self, anyhow::Error> {
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => bail!("Unsupported scheme {} in {}", other, uri),
            None => bail!("Can not find scheme in the uri:{}.", uri),
        };
        let host = uri
            .host()
            .ok_or(anyhow!("Can not find host in the uri:{}.", uri))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let default_port = match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };
        Ok(Self {
            scheme,
            host,
            port: uri.port_u16().unwrap_or(default_port),
        })
    }

    fn is_default_port(&self) -> bool {
        matches!(
            (self.scheme, self.port),
            (Scheme::Http, 80) | (Scheme::Https, 443)
        )
    }

    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.is_default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

struct Connection<B> {
    sender: http1::SendRequest<B>,
    slot: FirstByteSlot,
}

/// An HTTP/1.1 client that fires the lifecycle hooks of the [`Tracer`]
/// attached to each request.
///
/// Requests without a tracer run the same way with a throwaway one.
pub struct Transport<B = Full<Bytes>> {
    config: TransportConfig,
    resolver: DnsResolver,
    tls: TlsConnector,
    idle: Mutex<HashMap<PoolKey, Vec<Connection<B>>>>,
}

impl<B> Transport<B>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    pub fn new(config: TransportConfig) -> Result<Self, anyhow::Error> {
        let tls_config = tls::client_config(config.insecure, config.ca_file.as_deref())?;
        Ok(Self {
            config,
            resolver: DnsResolver::new(),
            tls: TlsConnector::from(Arc::new(tls_config)),
            idle: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn request(
        &self,
        mut req: Request<B>,
    ) -> Result<Response<Incoming>, anyhow::Error> {
        let tracer = Tracer::from_request(&req).unwrap_or_default();
        let key = PoolKey::from_uri(req.uri())?;
        into_origin_form(&mut req, &key)?;

        debug!("> {} {} {:?}", req.method(), req.uri(), req.version());

        let mut conn = match self.checkout(&key).await {
            Some(conn) => {
                debug!("Reusing connection to {}:{}", key.host, key.port);
                conn
            }
            None => self.connect(&key, &tracer).await?,
        };
        tracer.on_conn_acquired();

        conn.slot.arm(tracer);
        let res = timeout(self.config.request_timeout, conn.sender.send_request(req))
            .await
            .with_context(|| {
                format!(
                    "Request timed out after {} seconds",
                    self.config.request_timeout.as_secs()
                )
            })?
            .context("Failed to execute request")?;

        debug!("< {:?} {}", res.version(), res.status());
        if self.config.pool_idle {
            self.put_back(key, conn);
        }
        Ok(res)
    }

    async fn checkout(&self, key: &PoolKey) -> Option<Connection<B>> {
        if !self.config.pool_idle {
            return None;
        }
        let mut conn = {
            let mut idle = self.idle.lock();
            let list = idle.get_mut(key)?;
            list.retain(|c| !c.sender.is_closed());
            let conn = list.pop();
            if list.is_empty() {
                idle.remove(key);
            }
            conn
        }?;
        let ready = timeout(IDLE_READY_WAIT, conn.sender.ready()).await;
        match ready {
            Ok(Ok(())) => Some(conn),
            Ok(Err(e)) => {
                debug!("Discarding pooled connection: {}", e);
                None
            }
            Err(_) => {
                // still busy with an earlier response body
                self.put_back(key.clone(), conn);
                None
            }
        }
    }

    /// Returns `conn` to the pool and drops closed connections of every origin.
    fn put_back(&self, key: PoolKey, conn: Connection<B>) {
        let mut idle = self.idle.lock();
        idle.retain(|_, list| {
            list.retain(|c| !c.sender.is_closed());
            !list.is_empty()
        });
        idle.entry(key).or_default().push(conn);
    }

    async fn connect(
        &self,
        key: &PoolKey,
        tracer: &Tracer,
    ) -> Result<Connection<B>, anyhow::Error> {
        let addrs = match key.host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, key.port)],
            Err(_) => {
                tracer.on_dns_start();
                let mut resolver = self.resolver.clone();
                let resolved = resolver
                    .resolve(&key.host)
                    .await
                    .with_context(|| format!("Failed to resolve {}", key.host))?;
                tracer.on_dns_done();
                resolved
                    .into_iter()
                    .map(|mut addr| {
                        addr.set_port(key.port);
                        addr
                    })
                    .collect()
            }
        };

        tracer.on_connect_start();
        let stream = self.dial(&addrs).await?;
        tracer.on_connect_done();

        match key.scheme {
            Scheme::Http => self.handshake(stream).await,
            Scheme::Https => {
                let domain = pki_types::ServerName::try_from(key.host.as_str())
                    .map_err(|e| anyhow!("Invalid server name {}: {}", key.host, e))?
                    .to_owned();
                let handshake = self.tls.connect(domain, stream);
                let tls_stream = timeout(self.config.connect_timeout, handshake)
                    .await
                    .with_context(|| format!("TLS handshake with {} timed out", key.host))?
                    .with_context(|| format!("TLS handshake with {} failed", key.host))?;
                self.handshake(tls_stream).await
            }
        }
    }

    async fn dial(&self, addrs: &[SocketAddr]) -> Result<TcpStream, anyhow::Error> {
        let mut last_err = None;
        for addr in addrs {
            match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    debug!("Connected to {}", addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(
                        anyhow::Error::from(e).context(format!("Failed to connect to {}", addr)),
                    );
                }
                Err(_) => {
                    debug!("Connect to {} timed out", addr);
                    last_err = Some(anyhow!(
                        "Connection to {} timed out after {:?}",
                        addr,
                        self.config.connect_timeout
                    ));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("No addresses to connect to")))
    }

    async fn handshake<S>(&self, stream: S) -> Result<Connection<B>, anyhow::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (stream, slot) = FirstByteStream::new(stream);
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP/1.1 handshake failed")?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Connection closed: {:?}", err);
            }
        });
        Ok(Connection { sender, slot })
    }
}

/// Rewrites the request target to origin-form and fills in `Host`.
fn into_origin_form<B>(req: &mut Request<B>, key: &PoolKey) -> Result<(), anyhow::Error> {
    if !req.headers().contains_key(HOST) {
        let host = HeaderValue::from_str(&key.host_header())?;
        req.headers_mut().insert(HOST, host);
    }
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::builder().path_and_query(path).build()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-connection server answering a single request; `close` makes it
    /// hang up afterwards, otherwise it keeps the socket open.
    async fn serve_once(close: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let connection = if close { "close" } else { "keep-alive" };
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: {}\r\n\r\nok",
                connection
            );
            stream.write_all(head.as_bytes()).await.unwrap();
            if !close {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
        addr
    }

    async fn fetch(transport: &Transport, addr: SocketAddr) {
        let req = Request::get(format!("http://{}/", addr))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = transport.request(req).await.unwrap();
        res.into_body().collect().await.unwrap();
    }

    #[tokio::test]
    async fn test_put_back_prunes_closed_origins() {
        let transport: Transport = Transport::new(TransportConfig::default()).unwrap();
        let closing = serve_once(true).await;
        let open = serve_once(false).await;

        fetch(&transport, closing).await;
        for _ in 0..50 {
            let all_closed = transport
                .idle
                .lock()
                .values()
                .flatten()
                .all(|c| c.sender.is_closed());
            if all_closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        fetch(&transport, open).await;
        let idle = transport.idle.lock();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle.keys().next().map(|k| k.port), Some(open.port()));
    }

    #[test]
    fn test_pool_key_default_ports() {
        let key = PoolKey::from_uri(&"http://example.com/a".parse().unwrap()).unwrap();
        assert_eq!(key.scheme, Scheme::Http);
        assert_eq!(key.port, 80);
        assert_eq!(key.host_header(), "example.com");

        let key = PoolKey::from_uri(&"https://example.com:8443".parse().unwrap()).unwrap();
        assert_eq!(key.scheme, Scheme::Https);
        assert_eq!(key.port, 8443);
        assert_eq!(key.host_header(), "example.com:8443");
    }

    #[test]
    fn test_pool_key_ipv6() {
        let key = PoolKey::from_uri(&"http://[::1]:8080/".parse().unwrap()).unwrap();
        assert_eq!(key.host, "::1");
        assert!(key.host.parse::<IpAddr>().is_ok());
        assert_eq!(key.host_header(), "[::1]:8080");
    }

    #[test]
    fn test_pool_key_rejects_other_schemes() {
        assert!(PoolKey::from_uri(&"ftp://example.com/".parse().unwrap()).is_err());
        assert!(PoolKey::from_uri(&"/relative".parse().unwrap()).is_err());
    }

    #[test]
    fn test_origin_form() {
        let mut req = Request::get("http://example.com:8080/path?q=1")
            .body(())
            .unwrap();
        let key = PoolKey::from_uri(req.uri()).unwrap();
        into_origin_form(&mut req, &key).unwrap();
        assert_eq!(req.uri(), "/path?q=1");
        assert_eq!(req.headers()[HOST], "example.com:8080");
    }

    #[test]
    fn test_origin_form_keeps_host_header() {
        let mut req = Request::get("http://example.com")
            .header(HOST, "virtual.example")
            .body(())
            .unwrap();
        let key = PoolKey::from_uri(req.uri()).unwrap();
        into_origin_form(&mut req, &key).unwrap();
        assert_eq!(req.uri(), "/");
        assert_eq!(req.headers()[HOST], "virtual.example");
    }
}
