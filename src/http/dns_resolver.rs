use anyhow::Context;
use hyper_util::client::legacy::connect::dns::Name;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::vec;
use tower_service::Service;

/// Resolves host names with the system resolver on the blocking pool.
///
/// Returned addresses carry port 0; the caller sets the port it dials.
#[derive(Clone, Debug, Default)]
pub struct DnsResolver;

impl DnsResolver {
    pub fn new() -> Self {
        Self
    }

    pub async fn resolve(&mut self, host: &str) -> Result<Vec<SocketAddr>, anyhow::Error> {
        let name: Name = host
            .parse()
            .map_err(|e| anyhow!("Invalid host name {}: {}", host, e))?;
        debug!("Looking up {}", host);
        std::future::poll_fn(|cx| self.poll_ready(cx)).await?;
        let addrs: Vec<SocketAddr> = self.call(name).await?.collect();
        if let Some(first) = addrs.first() {
            debug!("{} has {} address(es), first {}", host, addrs.len(), first.ip());
        }
        Ok(addrs)
    }
}

impl Service<Name> for DnsResolver {
    type Response = vec::IntoIter<SocketAddr>;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let host = name.as_str().to_owned();
        Box::pin(async move {
            let lookup = host.clone();
            let addrs: Vec<SocketAddr> =
                tokio::task::spawn_blocking(move || (lookup.as_str(), 0).to_socket_addrs())
                    .await?
                    .with_context(|| format!("Lookup of {} failed", host))?
                    .collect();
            ensure!(!addrs.is_empty(), "No IP addresses found for host {}", host);
            Ok(addrs.into_iter())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addrs = DnsResolver::new().resolve("localhost").await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.ip().is_loopback()));
    }
}
