use std::path::{Path, PathBuf};

use crate::config::{InitSource, MetricSource, RunConfig};
use crate::error::{ChainError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum InitArgument {
    Radius(f64),
    File(PathBuf),
}

/// Fully resolved parameters for one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSpec {
    pub index: usize,
    pub chain_id: u64,
    pub seed: u32,
    pub data_file: Option<PathBuf>,
    pub init: Option<InitArgument>,
    pub metric_file: Option<PathBuf>,
    pub step_size: Option<f64>,
    pub output_file: PathBuf,
    pub transcript_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl Invocation {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.display().to_string());
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn command_line(&self) -> String {
        shell_join(&self.argv())
    }
}

pub fn output_paths(basename: &Path, chain_id: u64) -> (PathBuf, PathBuf) {
    let base = basename.display();
    (
        PathBuf::from(format!("{}-{}.csv", base, chain_id)),
        PathBuf::from(format!("{}-{}.txt", base, chain_id)),
    )
}

pub fn resolve_chain(config: &RunConfig, index: usize) -> Result<ChainSpec> {
    let chain_id = *config
        .chain_ids()
        .get(index)
        .ok_or_else(|| ChainError::invalid(format!("no chain at index {}", index)))?;
    let seed = config.seeds()[index];
    let data_file = config
        .data()
        .and_then(|d| d.path_for(index))
        .map(absolute)
        .transpose()?;
    let init = match config.inits() {
        Some(InitSource::Radius(r)) => Some(InitArgument::Radius(*r)),
        Some(InitSource::Input(input)) => input
            .path_for(index)
            .map(absolute)
            .transpose()?
            .map(InitArgument::File),
        None => None,
    };
    let sampler = config.sampler();
    let metric_file = match &sampler.metric {
        Some(MetricSource::Files(files)) => files
            .for_chain(index)
            .map(|p| absolute(p))
            .transpose()?,
        _ => None,
    };
    let step_size = sampler
        .step_size
        .as_ref()
        .and_then(|s| s.for_chain(index))
        .copied();
    let (output_file, transcript_file) =
        output_paths(&absolute(config.output_basename())?, chain_id);
    Ok(ChainSpec {
        index,
        chain_id,
        seed,
        data_file,
        init,
        metric_file,
        step_size,
        output_file,
        transcript_file,
    })
}

/// The child runs in the executable's directory, so every path handed to it
/// must be absolute.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn require_file(kind: &str, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(ChainError::invalid(format!(
            "no such {} file {}",
            kind,
            path.display()
        )));
    }
    Ok(())
}

pub fn build_invocation(config: &RunConfig, index: usize) -> Result<(ChainSpec, Invocation)> {
    let program = config.executable().ok_or_else(|| {
        ChainError::invalid(format!(
            "model {} has no executable; compile it first",
            config.model_name()
        ))
    })?;
    require_file("executable", program)?;
    let program = absolute(program)?;
    let spec = resolve_chain(config, index)?;
    if let Some(data) = &spec.data_file {
        require_file("data", data)?;
    }
    if let Some(InitArgument::File(init)) = &spec.init {
        require_file("inits", init)?;
    }
    if let Some(metric) = &spec.metric_file {
        require_file("metric", metric)?;
    }

    let sampler = config.sampler();
    let mut args = vec![
        format!("id={}", spec.chain_id),
        "random".to_string(),
        format!("seed={}", spec.seed),
    ];
    if let Some(data) = &spec.data_file {
        args.push("data".to_string());
        args.push(format!("file={}", data.display()));
    }
    match &spec.init {
        Some(InitArgument::Radius(r)) => args.push(format!("init={}", r)),
        Some(InitArgument::File(p)) => args.push(format!("init={}", p.display())),
        None => {}
    }
    args.push("output".to_string());
    args.push(format!("file={}", spec.output_file.display()));

    args.push("method=sample".to_string());
    if let Some(n) = sampler.sampling_iters {
        args.push(format!("num_samples={}", n));
    }
    if let Some(n) = sampler.warmup_iters {
        args.push(format!("num_warmup={}", n));
    }
    if sampler.save_warmup {
        args.push("save_warmup=1".to_string());
    }
    if let Some(n) = sampler.thin {
        args.push(format!("thin={}", n));
    }
    if !sampler.adapt_engaged || sampler.adapt_delta.is_some() {
        args.push("adapt".to_string());
        if !sampler.adapt_engaged {
            args.push("engaged=0".to_string());
        }
        if let Some(delta) = sampler.adapt_delta {
            args.push(format!("delta={}", delta));
        }
    }
    args.push("algorithm=hmc".to_string());
    if let Some(depth) = sampler.max_treedepth {
        args.push("engine=nuts".to_string());
        args.push(format!("max_depth={}", depth));
    }
    match &sampler.metric {
        Some(MetricSource::Diag) => args.push("metric=diag_e".to_string()),
        Some(MetricSource::Dense) => args.push("metric=dense_e".to_string()),
        Some(MetricSource::Files(_)) | None => {}
    }
    if let Some(metric) = &spec.metric_file {
        args.push(format!("metric_file={}", metric.display()));
    }
    if let Some(step) = spec.step_size {
        args.push(format!("stepsize={}", step));
    }

    let working_dir = program
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let invocation = Invocation {
        program,
        args,
        working_dir,
    };
    Ok((spec, invocation))
}

pub fn build_all(config: &RunConfig) -> Result<Vec<(ChainSpec, Invocation)>> {
    (0..config.chains())
        .map(|index| build_invocation(config, index))
        .collect()
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
