//! Runs the chains of a compiled sampler program as parallel child processes.
//!
//! A [`SampleRequest`] is validated into a [`RunConfig`] before anything is
//! spawned. [`run_chains`] then executes one process per chain with bounded
//! concurrency, and [`sample`] additionally checks exit codes and output files.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod invocation;
pub mod model;
pub mod outcome;
pub mod pool;
pub mod runner;

pub use config::{
    InitArg, InitSource, InputArg, InputSource, MetricSource, OneOrMany, PerChain, RunConfig,
    RunSettings, SampleRequest, SamplerOptions,
};
pub use error::{ChainError, ChainFailure, Result};
pub use invocation::{build_all, build_invocation, ChainSpec, InitArgument, Invocation};
pub use model::{CompileOptions, Model, Toolchain};
pub use outcome::{ChainOutcome, ChainStatus, RunResult};
pub use pool::{TaskQueue, WorkerPool};
pub use runner::{run_chains, sample, summary_path};
