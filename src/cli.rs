//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

/// Execute one HTTP command with retries and typed error classification.
///
/// Prints the response body to stdout. Exits 0 when the command succeeds and
/// 1 when it fails or cannot be sent.
#[derive(Parser, Debug)]
#[command(name = "cloudexec")]
#[command(author, version, about)]
pub struct Args {
    /// HTTP method (GET, PUT, POST, DELETE, HEAD)
    #[arg(value_parser = parse_method)]
    pub method: Method,

    /// Request URL
    pub url: Url,

    /// Request header as "Name: value" (repeatable, order kept)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(HeaderName, HeaderValue)>,

    /// Request body text
    #[arg(short = 'd', long, conflicts_with = "data_file")]
    pub data: Option<String>,

    /// Read the request body from a file
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Content type of the request body
    #[arg(long)]
    pub content_type: Option<String>,

    /// Stream the body with chunked transfer encoding instead of Content-Length
    #[arg(long)]
    pub chunked: bool,

    /// Print the status line and response headers before the body
    #[arg(short = 'i', long)]
    pub include: bool,

    /// Attempt ceiling including the first attempt (1-20)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_attempts: Option<u32>,

    /// Per-attempt timeout in milliseconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_ms: Option<u64>,

    /// JSON executor config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

fn parse_method(value: &str) -> Result<Method, String> {
    Method::from_bytes(value.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method: {value}"))
}

fn parse_header(value: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, raw) = value
        .split_once(':')
        .ok_or_else(|| format!("header must look like \"Name: value\": {value}"))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| format!("invalid header name: {}", name.trim()))?;
    let raw = raw.trim();
    let value = HeaderValue::from_str(raw).map_err(|_| format!("invalid header value: {raw}"))?;
    Ok((name, value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_minimal_args() {
        let args = Args::try_parse_from(["cloudexec", "get", "https://api.example.com/x"]).unwrap();
        assert_eq!(args.method, Method::GET);
        assert_eq!(args.url.as_str(), "https://api.example.com/x");
        assert!(args.headers.is_empty());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.max_attempts.is_none());
    }

    #[test]
    fn test_cli_headers_keep_order() {
        let args = Args::try_parse_from([
            "cloudexec",
            "PUT",
            "https://api.example.com/x",
            "-H",
            "X-Meta: one",
            "--header",
            "x-meta:two",
        ])
        .unwrap();
        let values: Vec<_> = args.headers.iter().map(|(_, v)| v.to_str().unwrap()).collect();
        assert_eq!(values, vec!["one", "two"]);
        assert_eq!(args.headers[0].0.as_str(), "x-meta");
    }

    #[test]
    fn test_cli_header_without_colon_rejected() {
        let result = Args::try_parse_from(["cloudexec", "GET", "https://a.example", "-H", "novalue"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_data_conflicts_with_data_file() {
        let result = Args::try_parse_from([
            "cloudexec",
            "POST",
            "https://a.example",
            "-d",
            "x",
            "--data-file",
            "body.bin",
        ]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ArgumentConflict
        );
    }

    #[test]
    fn test_cli_max_attempts_range() {
        let args =
            Args::try_parse_from(["cloudexec", "GET", "https://a.example", "-r", "3"]).unwrap();
        assert_eq!(args.max_attempts, Some(3));

        let result = Args::try_parse_from(["cloudexec", "GET", "https://a.example", "-r", "0"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_invalid_url_rejected() {
        let result = Args::try_parse_from(["cloudexec", "GET", "not a url"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["cloudexec", "-vv", "GET", "https://a.example"]).unwrap();
        assert_eq!(args.verbose, 2);
    }
}
