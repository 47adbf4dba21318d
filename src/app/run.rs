use crate::cli::app_config::Cli;
use crate::http::tracer::{instrument, Tracer};
use crate::http::transport::{Transport, TransportConfig};
use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use http::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Outcome of one traced request whose body was read to the end.
#[derive(Debug)]
pub struct TracedResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub tracer: Tracer,
}

pub async fn main_with_error() -> Result<(), anyhow::Error> {
    let cli: Cli = Cli::parse();
    init_logging(cli.verbosity)?;
    do_request(cli).await
}

fn init_logging(verbosity: u8) -> Result<(), anyhow::Error> {
    let log_level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy()
        .add_directive("hyper_util=off".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .with_max_level(log_level)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(())
}

pub fn transport_config(cli: &Cli) -> TransportConfig {
    TransportConfig {
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        request_timeout: Duration::from_secs(cli.max_time),
        pool_idle: !cli.no_reuse,
        insecure: cli.skip_certificate_validate,
        ca_file: cli.certificate_path_option.clone(),
    }
}

async fn do_request(cli: Cli) -> Result<(), anyhow::Error> {
    let transport: Transport = Transport::new(transport_config(&cli))?;

    for i in 0..cli.count {
        let request = build_request(&cli)?;
        let traced = trace_request(&transport, request)
            .await
            .with_context(|| format!("Request {} to {} failed", i + 1, cli.url))?;

        info!(
            "{} {} ({} bytes)",
            traced.status,
            cli.url,
            traced.body.len()
        );
        if cli.json {
            println!("{}", serde_json::to_string(&traced.tracer.metrics())?);
        } else {
            println!("{}", traced.tracer);
        }
    }
    Ok(())
}

/// Sends `request` through `transport`, reads the whole body and finishes the
/// tracer. The transport's request timeout bounds the exchange including the
/// body.
pub async fn trace_request(
    transport: &Transport,
    request: Request<Full<Bytes>>,
) -> Result<TracedResponse, anyhow::Error> {
    let limit = transport.config().request_timeout;
    timeout(limit, exchange(transport, request))
        .await
        .with_context(|| format!("Request timed out after {} seconds", limit.as_secs()))?
}

async fn exchange(
    transport: &Transport,
    request: Request<Full<Bytes>>,
) -> Result<TracedResponse, anyhow::Error> {
    let (request, tracer) = instrument(request);
    let res = transport.request(request).await?;
    let status = res.status();
    let body = res
        .into_body()
        .collect()
        .await
        .context("Failed to read response body")?
        .to_bytes();
    tracer.finish();
    Ok(TracedResponse {
        status,
        body,
        tracer,
    })
}

fn build_request(cli: &Cli) -> Result<Request<Full<Bytes>>, anyhow::Error> {
    let mut method = String::from("GET");
    let mut content_type_option = None;

    if cli.body_option.is_some() {
        method = String::from("POST");
        content_type_option = Some("application/x-www-form-urlencoded");
    }
    if let Some(method_userdefined) = cli.method_option.as_ref() {
        method = method_userdefined.clone();
    }

    let mut request_builder = Request::builder()
        .method(method.as_str())
        .uri(cli.url.as_str())
        .header(ACCEPT, "*/*")
        .header(
            USER_AGENT,
            concat!("httptracer/", env!("CARGO_PKG_VERSION")),
        );
    if let Some(content_type) = content_type_option {
        request_builder = request_builder.header(CONTENT_TYPE, content_type);
    }

    for x in &cli.headers {
        let split: Vec<&str> = x.splitn(2, ':').collect();
        ensure!(split.len() == 2, "header error: '{}'", x);
        request_builder = request_builder.header(
            HeaderName::from_str(split[0].trim())?,
            HeaderValue::from_str(split[1].trim_start())?,
        );
    }

    let body = cli
        .body_option
        .clone()
        .map_or(Bytes::new(), Bytes::from);
    let request = request_builder.body(Full::new(body))?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("httptracer").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_build_get() {
        let request = build_request(&cli(&["http://localhost:8080/x"])).unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.uri(), "http://localhost:8080/x");
        assert!(request.headers().contains_key(USER_AGENT));
    }

    #[test]
    fn test_build_post_with_headers() {
        let request = build_request(&cli(&[
            "-d",
            "a=1",
            "-H",
            "X-Trace: yes",
            "http://localhost/",
        ]))
        .unwrap();
        assert_eq!(request.method(), "POST");
        assert_eq!(request.headers()["x-trace"], "yes");
        assert_eq!(
            request.headers()[CONTENT_TYPE],
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn test_build_rejects_malformed_header() {
        assert!(build_request(&cli(&["-H", "nocolon", "http://localhost/"])).is_err());
    }

    #[test]
    fn test_transport_config_from_flags() {
        let config = transport_config(&cli(&["--no-reuse", "-k", "-m", "5", "http://localhost/"]));
        assert!(!config.pool_idle);
        assert!(config.insecure);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
    }
}
