//! CLI entry point for cloudexec.

use std::io::Write;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use cloudexec_core::{
    Command, CommandExecutor, ExecutionError, ExecutorConfig, Payload, Request, Response,
};
use tracing::{debug, info};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // stdout carries the response body
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = resolve_config(&args)?;
    let executor = CommandExecutor::new(&config)?;
    let request = build_request(&args).await?;

    let mut command = match executor.execute(Command::new(request)).await {
        Ok(command) => command,
        Err(ExecutionError::Rejected(error)) => {
            eprintln!("error: {error}");
            return Ok(ExitCode::FAILURE);
        }
        Err(error) => return Err(error.into()),
    };

    info!(
        attempts = command.attempts(),
        state = %command.state(),
        retried = executor.stats().retried(),
        "command finished"
    );

    let body = if command.error().is_none()
        && let Some(response) = command.response_mut()
    {
        response
            .bytes()
            .await
            .context("failed to read response body")?
    } else {
        Default::default()
    };

    let mut stdout = std::io::stdout().lock();
    if args.include
        && let Some(response) = command.response()
    {
        write_head(&mut stdout, response)?;
    }
    stdout.write_all(&body)?;
    stdout.flush()?;

    if let Some(error) = command.error() {
        eprintln!("error: {error}");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

/// File config (if any) overridden by CLI flags.
fn resolve_config(args: &Args) -> Result<ExecutorConfig> {
    let mut config = match &args.config {
        Some(path) => ExecutorConfig::from_json_file(path)?,
        None => ExecutorConfig::default(),
    };
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.attempt_timeout_ms = Some(timeout_ms);
    }
    debug!(?config, "resolved executor config");
    Ok(config)
}

async fn build_request(args: &Args) -> Result<Request> {
    let mut request = Request::new(args.method.clone(), args.url.clone());
    for (name, value) in &args.headers {
        request = request.with_header(name.clone(), value.clone());
    }

    let payload = match (&args.data, &args.data_file) {
        (Some(data), _) => Some(Payload::from_string(data.clone())),
        (None, Some(path)) => Some(
            Payload::from_file(path)
                .await
                .with_context(|| format!("cannot use {} as request body", path.display()))?,
        ),
        (None, None) => None,
    };

    let Some(mut payload) = payload else {
        return Ok(request);
    };
    if args.chunked {
        payload = Payload::from_stream(payload.into_stream()?, None);
        request = request.chunked();
    }
    if let Some(content_type) = &args.content_type {
        payload = payload.with_content_type(content_type.clone());
    }
    Ok(request.with_payload(payload))
}

fn write_head(out: &mut impl Write, response: &Response) -> Result<()> {
    writeln!(out, "HTTP {}", response.status_line())?;
    for (name, value) in response.headers() {
        writeln!(out, "{}: {}", name, String::from_utf8_lossy(value.as_bytes()))?;
    }
    writeln!(out)?;
    Ok(())
}
