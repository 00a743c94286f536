//! Caller-facing run configuration and its validated form.
//!
//! [`SampleRequest`] mirrors what a caller (or a run file) asks for and is
//! loose: numbers are signed, per-chain values may be scalars or
//! lists, inputs may be paths or inline mappings. [`RunConfig::validate`] turns
//! it into an immutable [`RunConfig`] or fails with
//! [`ChainError::InvalidConfig`] before anything is spawned.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::artifacts::{reserve_unique_name, write_temp_json};
use crate::error::{ChainError, Result};

const MAX_SEED: i64 = u32::MAX as i64;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InputArg {
    Path(PathBuf),
    Paths(Vec<PathBuf>),
    Mapping(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InitArg {
    Radius(f64),
    Input(InputArg),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SampleRequest {
    pub chains: i64,
    pub cores: i64,
    pub seed: Option<OneOrMany<i64>>,
    pub chain_ids: Option<OneOrMany<i64>>,
    pub data: Option<InputArg>,
    pub inits: Option<InitArg>,
    pub warmup_iters: Option<i64>,
    pub sampling_iters: Option<i64>,
    pub save_warmup: bool,
    pub thin: Option<i64>,
    pub max_treedepth: Option<i64>,
    pub metric: Option<OneOrMany<String>>,
    pub step_size: Option<OneOrMany<f64>>,
    pub adapt_engaged: bool,
    pub adapt_delta: Option<f64>,
    pub csv_basename: Option<PathBuf>,
}

impl Default for SampleRequest {
    fn default() -> Self {
        Self {
            chains: 4,
            cores: 1,
            seed: None,
            chain_ids: None,
            data: None,
            inits: None,
            warmup_iters: None,
            sampling_iters: None,
            save_warmup: false,
            thin: None,
            max_treedepth: None,
            metric: None,
            step_size: None,
            adapt_engaged: true,
            adapt_delta: None,
            csv_basename: None,
        }
    }
}

/// Process environment a run is validated against.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub tmp_dir: PathBuf,
    pub available_cores: usize,
}

impl RunSettings {
    pub fn detect() -> Self {
        let available_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            tmp_dir: std::env::temp_dir().join("chain-runner"),
            available_cores,
        }
    }

    pub fn with_tmp_dir(mut self, tmp_dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = tmp_dir.into();
        self
    }

    pub fn with_available_cores(mut self, available_cores: usize) -> Self {
        self.available_cores = available_cores.max(1);
        self
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::detect()
    }
}

/// A value that is either shared by every chain or given once per chain.
#[derive(Debug, Clone, PartialEq)]
pub enum PerChain<T> {
    Shared(T),
    Each(Vec<T>),
}

impl<T> PerChain<T> {
    pub fn for_chain(&self, index: usize) -> Option<&T> {
        match self {
            Self::Shared(value) => Some(value),
            Self::Each(values) => values.get(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// An in-memory mapping, already written to a temporary JSON file.
    InlineMapping(PathBuf),
    FilePath(PathBuf),
    PerChainFilePaths(Vec<PathBuf>),
}

impl InputSource {
    pub fn path_for(&self, index: usize) -> Option<&Path> {
        match self {
            Self::InlineMapping(path) | Self::FilePath(path) => Some(path),
            Self::PerChainFilePaths(paths) => paths.get(index).map(PathBuf::as_path),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InitSource {
    /// Uniform initialization on `[-r, r]`; zero initializes everything to 0.
    Radius(f64),
    Input(InputSource),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricSource {
    Diag,
    Dense,
    Files(PerChain<PathBuf>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerOptions {
    pub warmup_iters: Option<u64>,
    pub sampling_iters: Option<u64>,
    pub save_warmup: bool,
    pub thin: Option<u64>,
    pub max_treedepth: Option<u64>,
    pub metric: Option<MetricSource>,
    pub step_size: Option<PerChain<f64>>,
    pub adapt_engaged: bool,
    pub adapt_delta: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    model_name: String,
    executable: Option<PathBuf>,
    chain_ids: Vec<u64>,
    seeds: Vec<u32>,
    requested_cores: usize,
    cores: usize,
    data: Option<InputSource>,
    inits: Option<InitSource>,
    sampler: SamplerOptions,
    output_basename: PathBuf,
    temp_inputs: Vec<PathBuf>,
}

impl RunConfig {
    pub fn validate(
        request: &SampleRequest,
        model_name: &str,
        executable: Option<PathBuf>,
        settings: &RunSettings,
    ) -> Result<Self> {
        if request.chains < 1 {
            return Err(ChainError::invalid(format!(
                "chains must be a positive integer value, found {}",
                request.chains
            )));
        }
        let chains = request.chains as usize;
        let chain_ids = resolve_chain_ids(request.chain_ids.as_ref(), chains)?;
        let (requested_cores, cores) = resolve_cores(request.cores, settings.available_cores)?;
        let seeds = resolve_seeds(request.seed.as_ref(), chains)?;
        let sampler = resolve_sampler(request, chains)?;
        if let Some(InitArg::Radius(r)) = &request.inits {
            if !r.is_finite() || *r < 0.0 {
                return Err(ChainError::invalid(format!(
                    "inits must be a non-negative number, found {}",
                    r
                )));
            }
        }
        check_input_lengths("data", request.data.as_ref(), chains)?;
        if let Some(InitArg::Input(input)) = &request.inits {
            check_input_lengths("inits", Some(input), chains)?;
        }
        if let Some(basename) = &request.csv_basename {
            check_basename(basename)?;
        }

        // Everything below touches the filesystem; all pure checks are done.
        let mut temp_inputs = Vec::new();
        let data = match &request.data {
            Some(arg) => Some(materialize(arg, "data-", settings, &mut temp_inputs)?),
            None => None,
        };
        let inits = match &request.inits {
            Some(InitArg::Radius(r)) => Some(InitSource::Radius(*r)),
            Some(InitArg::Input(arg)) => Some(InitSource::Input(materialize(
                arg,
                "inits-",
                settings,
                &mut temp_inputs,
            )?)),
            None => None,
        };
        let output_basename = match &request.csv_basename {
            Some(basename) => basename.clone(),
            None => reserve_unique_name(
                &settings.tmp_dir,
                &format!("{}-{}-", model_name, Utc::now().format("%Y%m%d%H%M%S")),
            )?,
        };
        debug!(
            chains,
            cores,
            basename = %output_basename.display(),
            "validated run configuration"
        );

        Ok(Self {
            model_name: model_name.to_string(),
            executable,
            chain_ids,
            seeds,
            requested_cores,
            cores,
            data,
            inits,
            sampler,
            output_basename,
            temp_inputs,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn chains(&self) -> usize {
        self.chain_ids.len()
    }

    pub fn chain_ids(&self) -> &[u64] {
        &self.chain_ids
    }

    pub fn seeds(&self) -> &[u32] {
        &self.seeds
    }

    pub fn requested_cores(&self) -> usize {
        self.requested_cores
    }

    /// Worker count actually used: the request clamped to available cores.
    pub fn cores(&self) -> usize {
        self.cores
    }

    pub fn data(&self) -> Option<&InputSource> {
        self.data.as_ref()
    }

    pub fn inits(&self) -> Option<&InitSource> {
        self.inits.as_ref()
    }

    pub fn sampler(&self) -> &SamplerOptions {
        &self.sampler
    }

    pub fn output_basename(&self) -> &Path {
        &self.output_basename
    }

    pub fn temp_inputs(&self) -> &[PathBuf] {
        &self.temp_inputs
    }
}

fn resolve_chain_ids(arg: Option<&OneOrMany<i64>>, chains: usize) -> Result<Vec<u64>> {
    match arg {
        None => Ok((1..=chains as u64).collect()),
        Some(OneOrMany::One(offset)) => {
            if *offset < 1 {
                return Err(ChainError::invalid(format!(
                    "chain_id must be a positive integer value, found {}",
                    offset
                )));
            }
            let offset = *offset as u64;
            Ok((0..chains as u64).map(|i| offset + i + 1).collect())
        }
        Some(OneOrMany::Many(ids)) => {
            if ids.len() != chains {
                return Err(ChainError::invalid(format!(
                    "chain_ids must correspond to number of chains specified {} chains, found {} chain_ids",
                    chains,
                    ids.len()
                )));
            }
            let mut seen = BTreeSet::new();
            for id in ids {
                if *id < 1 {
                    return Err(ChainError::invalid(format!(
                        "chain_id must be a positive integer value, found {}",
                        id
                    )));
                }
                if !seen.insert(*id) {
                    return Err(ChainError::invalid(format!("duplicate chain_id {}", id)));
                }
            }
            Ok(ids.iter().map(|id| *id as u64).collect())
        }
    }
}

fn resolve_cores(requested: i64, available: usize) -> Result<(usize, usize)> {
    if requested < 1 {
        return Err(ChainError::invalid(format!(
            "cores must be a positive integer value, found {}",
            requested
        )));
    }
    let requested = requested as usize;
    let available = available.max(1);
    if requested > available {
        warn!(requested, available, "requested more cores than available");
        return Ok((requested, available));
    }
    Ok((requested, requested))
}

fn check_seed(seed: i64) -> Result<u32> {
    if !(0..=MAX_SEED).contains(&seed) {
        return Err(ChainError::invalid(format!(
            "seed must be an integer between 0 and 2^32-1, found {}",
            seed
        )));
    }
    Ok(seed as u32)
}

fn resolve_seeds(arg: Option<&OneOrMany<i64>>, chains: usize) -> Result<Vec<u32>> {
    match arg {
        None => {
            let seed = rand::random::<u32>();
            debug!(seed, "no seed given, drew one for all chains");
            Ok(vec![seed; chains])
        }
        Some(OneOrMany::One(seed)) => Ok(vec![check_seed(*seed)?; chains]),
        Some(OneOrMany::Many(seeds)) => {
            check_len("seed", seeds.len(), chains)?;
            seeds.iter().map(|s| check_seed(*s)).collect()
        }
    }
}

fn check_len(option: &str, found: usize, chains: usize) -> Result<()> {
    if found != chains {
        return Err(ChainError::invalid(format!(
            "number of {} values must match number of chains, found {} values for {} chains",
            option, found, chains
        )));
    }
    Ok(())
}

fn check_input_lengths(option: &str, arg: Option<&InputArg>, chains: usize) -> Result<()> {
    if let Some(InputArg::Paths(paths)) = arg {
        check_len(option, paths.len(), chains)?;
    }
    Ok(())
}

fn check_basename(basename: &Path) -> Result<()> {
    if basename.file_name().is_none() {
        return Err(ChainError::invalid(format!(
            "csv_basename must name a file, found {}",
            basename.display()
        )));
    }
    match basename.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err(ChainError::invalid(format!(
                "csv_basename directory does not exist: {}",
                parent.display()
            )))
        }
        _ => Ok(()),
    }
}

fn at_least(option: &str, value: Option<i64>, min: i64) -> Result<Option<u64>> {
    match value {
        Some(v) if v < min => Err(ChainError::invalid(format!(
            "{} must be at least {}, found {}",
            option, min, v
        ))),
        Some(v) => Ok(Some(v as u64)),
        None => Ok(None),
    }
}

fn resolve_sampler(request: &SampleRequest, chains: usize) -> Result<SamplerOptions> {
    let warmup_iters = at_least("warmup_iters", request.warmup_iters, 0)?;
    let sampling_iters = at_least("sampling_iters", request.sampling_iters, 1)?;
    let thin = at_least("thin", request.thin, 1)?;
    let max_treedepth = at_least("max_treedepth", request.max_treedepth, 1)?;

    if request.adapt_engaged && warmup_iters == Some(0) {
        return Err(ChainError::invalid(
            "adapt_engaged requires warmup_iters > 0",
        ));
    }
    if let Some(delta) = request.adapt_delta {
        if !(delta > 0.0 && delta < 1.0) {
            return Err(ChainError::invalid(format!(
                "adapt_delta must be between 0 and 1 (exclusive), found {}",
                delta
            )));
        }
    }

    let step_size = match &request.step_size {
        None => None,
        Some(OneOrMany::One(step)) => {
            check_step(*step)?;
            Some(PerChain::Shared(*step))
        }
        Some(OneOrMany::Many(steps)) => {
            check_len("step_size", steps.len(), chains)?;
            for step in steps {
                check_step(*step)?;
            }
            Some(PerChain::Each(steps.clone()))
        }
    };

    let metric = match &request.metric {
        None => None,
        Some(OneOrMany::One(name)) => Some(match name.as_str() {
            "diag" | "diag_e" => MetricSource::Diag,
            "dense" | "dense_e" => MetricSource::Dense,
            path => MetricSource::Files(PerChain::Shared(PathBuf::from(path))),
        }),
        Some(OneOrMany::Many(paths)) => {
            check_len("metric", paths.len(), chains)?;
            let unique: BTreeSet<&String> = paths.iter().collect();
            if unique.len() != paths.len() {
                return Err(ChainError::invalid(
                    "per-chain metric files must be unique",
                ));
            }
            Some(MetricSource::Files(PerChain::Each(
                paths.iter().map(PathBuf::from).collect(),
            )))
        }
    };

    Ok(SamplerOptions {
        warmup_iters,
        sampling_iters,
        save_warmup: request.save_warmup,
        thin,
        max_treedepth,
        metric,
        step_size,
        adapt_engaged: request.adapt_engaged,
        adapt_delta: request.adapt_delta,
    })
}

fn check_step(step: f64) -> Result<()> {
    if !step.is_finite() || step <= 0.0 {
        return Err(ChainError::invalid(format!(
            "step_size must be > 0, found {}",
            step
        )));
    }
    Ok(())
}

fn materialize(
    arg: &InputArg,
    prefix: &str,
    settings: &RunSettings,
    written: &mut Vec<PathBuf>,
) -> Result<InputSource> {
    Ok(match arg {
        InputArg::Path(path) => InputSource::FilePath(path.clone()),
        InputArg::Paths(paths) => InputSource::PerChainFilePaths(paths.clone()),
        InputArg::Mapping(values) => {
            let path = write_temp_json(&settings.tmp_dir, prefix, &Value::Object(values.clone()))?;
            debug!(path = %path.display(), "wrote inline mapping");
            written.push(path.clone());
            InputSource::InlineMapping(path)
        }
    })
}
