//! Logging setup for SPMD training runs.
//!
//! Every rank runs the same program, so an unfiltered subscriber
//! multiplies each log line by the world size. Rank-aware
//! initialization keeps non-root ranks at warnings unless `RUST_LOG`
//! overrides, and the topology announcement records where each process
//! landed after communicator construction.

use crate::comm::Communicator;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    /// Human-readable (default)
    Pretty,
    /// JSON for log aggregation
    Json,
    /// Single-line compact
    Compact,
}

impl LogFormat {
    /// Format selected by `COHORT_LOG_FORMAT`: "json", "compact", or
    /// anything else for pretty.
    pub fn from_env() -> Self {
        match std::env::var("COHORT_LOG_FORMAT")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("json") => LogFormat::Json,
            Ok("compact") => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// `RUST_LOG` wins; otherwise only the world root is chatty.
fn rank_filter(world_rank: usize) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if world_rank == 0 {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("warn")
        }
    })
}

fn install(filter: EnvFilter, format: LogFormat) {
    let builder = fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.with_target(true).init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
        LogFormat::Compact => builder.compact().with_target(false).init(),
    }
}

/// Initialize logging before a communicator exists (single-rank tools,
/// tests). Level defaults to `info`; format comes from
/// `COHORT_LOG_FORMAT`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter, LogFormat::from_env());
}

/// Initialize logging for one rank of an SPMD world: the world root
/// logs at `info`, every other rank at `warn`, with `RUST_LOG`
/// overriding both.
pub fn init_rank_logging(world_rank: usize) {
    install(rank_filter(world_rank), LogFormat::from_env());
}

/// Record where this process sits in the topology. Call once after
/// communicator construction; the root's line doubles as a startup
/// marker for the whole world.
pub fn announce_topology(comm: &Communicator) {
    info!(
        world_rank = comm.world_rank(),
        world_size = comm.world_size(),
        num_models = comm.num_models(),
        model_rank = comm.model_rank(),
        rank_in_model = comm.rank_in_model(),
        rank_in_node = comm.rank_in_node(),
        host = %comm.world_comm().processor_name(),
        "process joined training world"
    );
}
