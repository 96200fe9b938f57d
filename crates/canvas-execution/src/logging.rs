//! Global tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured filter; without either the engine logs
//! at `info`.

use crate::tracing_layer::DiagnosticsLayer;
use anyhow::Context as _;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "info";

/// Output options for [`init_tracing`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is unset (e.g. "canvas_application=debug")
    pub filter: Option<String>,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
}

/// Resolves the effective filter.
pub fn env_filter(fallback: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = fallback.unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Installs the global subscriber, writing to stderr.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(options: &LogOptions) -> anyhow::Result<()> {
    init_with_diagnostics(options, None)
}

/// Like [`init_tracing`], additionally forwarding warnings to `diagnostics`.
pub fn init_with_diagnostics(
    options: &LogOptions,
    diagnostics: Option<DiagnosticsLayer>,
) -> anyhow::Result<()> {
    let (json_layer, text_layer) = if options.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
            None,
        )
    } else {
        (
            None,
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter(options.filter.as_deref()))
        .with(json_layer)
        .with(text_layer)
        .with(diagnostics)
        .try_init()
        .context("tracing subscriber already installed")?;

    tracing::debug!("[Logging] tracing initialized (json: {})", options.json);
    Ok(())
}
