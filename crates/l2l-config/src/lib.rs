//! Process-level runtime configuration shared by the meta-optimizer crates:
//! deterministic seeding for permutation sampling and tracing setup.

pub mod determinism;
pub mod tracing;

pub use determinism::{
    config, configure, rng_from_label, rng_from_optional, DeterminismConfig,
};
pub use self::tracing::{
    ensure_tracing, flush_chrome_trace, init_tracing, init_tracing_with, InitError,
    TracingOptions, DEFAULT_DIRECTIVE,
};
