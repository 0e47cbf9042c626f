use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::error;
use tracing_subscriber::EnvFilter;

use rstage::cli::{self, USAGE};
use rstage::config::Config;
use rstage::rserve::RserveConnector;
use rstage::stage::Stage;
use rstage::xml;

#[tokio::main]
async fn main() {
    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("rstage: {e}");
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    };

    // ── Logging (stdout carries the output messages) ─────────────────────────
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = match Config::load_file(&args.config) {
        Ok((config, errors)) if errors.is_empty() => config,
        Ok((_, errors)) => {
            for e in &errors {
                eprintln!("rstage: {}: {e}", args.config.display());
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("rstage: cannot read {}: {e}", args.config.display());
            std::process::exit(1);
        }
    };

    let connector = Arc::new(RserveConnector::new(config.server.clone()));
    let stage = match Stage::start(config, connector) {
        Ok(s) => s,
        Err(e) => {
            error!(code = e.code(), "{e}");
            std::process::exit(1);
        }
    };

    // ── Messages ──────────────────────────────────────────────────────────────
    let mut failed = false;
    if args.messages.is_empty() {
        let mut text = String::new();
        match tokio::io::stdin().read_to_string(&mut text).await {
            Ok(_) => failed |= !process(&stage, "<stdin>", &text).await,
            Err(e) => {
                eprintln!("rstage: cannot read standard input: {e}");
                failed = true;
            }
        }
    } else {
        for path in &args.messages {
            let label = path.display().to_string();
            match tokio::fs::read_to_string(path).await {
                Ok(text) => failed |= !process(&stage, &label, &text).await,
                Err(e) => {
                    eprintln!("rstage: cannot read {label}: {e}");
                    failed = true;
                }
            }
        }
    }

    stage.close().await;
    if failed {
        std::process::exit(1);
    }
}

/// Evaluate one XML message and print the result; `false` on failure.
async fn process(stage: &Stage, label: &str, text: &str) -> bool {
    let input = match xml::read_message(text) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("rstage: {label}: {e}");
            return false;
        }
    };
    let output = match stage.evaluate(&input).await {
        Ok(m) => m,
        Err(e) => {
            error!(code = e.code(), message = label, "{e}");
            return false;
        }
    };
    match xml::write_body(&output) {
        Ok(body) => {
            println!("{body}");
            true
        }
        Err(e) => {
            eprintln!("rstage: {label}: {e}");
            false
        }
    }
}
