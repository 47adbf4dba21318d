use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Trace the timing of each phase of an HTTP request")]
pub struct Cli {
    /// The request url,like http://www.google.com
    pub url: String,
    ///  Specify request method to use
    #[arg(short = 'X', long = "request", value_name = "method")]
    pub method_option: Option<String>,
    /// HTTP POST data.
    #[arg(short = 'd', long = "data", value_name = "data")]
    pub body_option: Option<String>,
    /// The http headers.
    #[arg(short = 'H', long = "header", value_name = "name: value")]
    pub headers: Vec<String>,
    /// PEM bundle of trusted CA certificates.
    #[arg(short = 'c', long = "cacert", value_name = "file")]
    pub certificate_path_option: Option<PathBuf>,
    /// Allow insecure server connections
    #[arg(short = 'k', long = "insecure")]
    pub skip_certificate_validate: bool,
    /// Number of sequential requests sent over one client
    #[arg(short = 'n', long = "count", default_value_t = 1, value_name = "N")]
    pub count: u32,
    /// Open a new connection for every request
    #[arg(long = "no-reuse")]
    pub no_reuse: bool,
    /// Print the timings as JSON
    #[arg(long = "json")]
    pub json: bool,
    /// Seconds allowed for connecting to the server
    #[arg(long = "connect-timeout", default_value_t = 10, value_name = "seconds")]
    pub connect_timeout: u64,
    /// Seconds allowed for the whole request
    #[arg(short = 'm', long = "max-time", default_value_t = 30, value_name = "seconds")]
    pub max_time: u64,
    ///  Make the operation more talkative
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["httptracer", "http://localhost"]).unwrap();
        assert_eq!(cli.count, 1);
        assert_eq!(cli.connect_timeout, 10);
        assert_eq!(cli.max_time, 30);
        assert!(!cli.no_reuse);
        assert_eq!(cli.verbosity, 0);
    }

    #[test]
    fn test_repeated_flags() {
        let cli = Cli::try_parse_from([
            "httptracer",
            "-vv",
            "-H",
            "Accept: text/plain",
            "-H",
            "X-Trace: 1",
            "-n",
            "3",
            "--json",
            "http://localhost",
        ])
        .unwrap();
        assert_eq!(cli.verbosity, 2);
        assert_eq!(cli.headers.len(), 2);
        assert_eq!(cli.count, 3);
        assert!(cli.json);
    }
}
