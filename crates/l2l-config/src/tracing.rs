// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();
static CHROME_GUARD: OnceLock<Mutex<Option<tracing_chrome::FlushGuard>>> = OnceLock::new();

/// Directive applied when `RUST_LOG` is unset: step summaries and resets from
/// the core, warnings from everything else.
pub const DEFAULT_DIRECTIVE: &str = "warn,l2l_core=info";

/// Subscriber settings for meta-optimizer drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    pub default_directive: String,
    /// Chrome trace output; `None` disables the layer.
    pub chrome_trace: Option<PathBuf>,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            default_directive: DEFAULT_DIRECTIVE.to_string(),
            chrome_trace: None,
        }
    }
}

impl TracingOptions {
    /// Defaults plus the Chrome trace file named by `L2L_TRACE_CHROME`.
    pub fn from_env() -> Result<Self, InitError> {
        Ok(Self {
            chrome_trace: chrome_trace_path()?,
            ..Self::default()
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

/// Installs the global subscriber configured from the environment.
pub fn init_tracing() -> Result<(), InitError> {
    init_tracing_with(TracingOptions::from_env()?)
}

/// Installs the global subscriber: an fmt layer filtered by `RUST_LOG`, plus a
/// Chrome trace layer when `options.chrome_trace` is set.
pub fn init_tracing_with(options: TracingOptions) -> Result<(), InitError> {
    INITIALISED
        .set(())
        .map_err(|_| InitError::AlreadyInitialised)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal());
    let registry = Registry::default().with(options.filter()).with(fmt_layer);

    match &options.chrome_trace {
        Some(path) => {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            let cell = CHROME_GUARD.get_or_init(|| Mutex::new(None));
            if let Ok(mut slot) = cell.lock() {
                *slot = Some(guard);
            }
            registry.with(chrome_layer).try_init()?;
        }
        None => registry.try_init()?,
    }
    Ok(())
}

/// Like [`init_tracing`], but a subscriber installed earlier by this crate is
/// not an error. Test harnesses call it from every test.
pub fn ensure_tracing() -> Result<(), InitError> {
    match init_tracing() {
        Err(InitError::AlreadyInitialised) => Ok(()),
        other => other,
    }
}

/// Flushes and drops the Chrome trace guard, if one was installed.
pub fn flush_chrome_trace() {
    if let Some(cell) = CHROME_GUARD.get() {
        if let Ok(mut slot) = cell.lock() {
            slot.take();
        }
    }
}

fn chrome_trace_path() -> Result<Option<PathBuf>, InitError> {
    match std::env::var("L2L_TRACE_CHROME") {
        Ok(raw) if !raw.trim().is_empty() => Ok(Some(PathBuf::from(raw))),
        Ok(_) => Ok(None),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(InitError::Env(err)),
    }
}

/// Errors emitted when configuring the tracing subscriber.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tracing has already been initialised")]
    AlreadyInitialised,
    #[error("failed to read L2L_TRACE_CHROME: {0}")]
    Env(std::env::VarError),
    #[error("another global subscriber is installed: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}
