use anyhow::{anyhow, Context, Result};
use chain_runner::{
    build_all, ChainError, CompileOptions, InitArg, InputArg, Model, OneOrMany, RunConfig,
    RunResult, RunSettings, SampleRequest, Toolchain,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "chains", version = "0.3.0", about = "Parallel sampler chain runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        run_file: PathBuf,
        #[arg(long)]
        cmdstan: Option<PathBuf>,
        #[arg(long)]
        cores: Option<i64>,
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        run_file: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Compile {
        stan_file: PathBuf,
        #[arg(long)]
        cmdstan: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        opt_level: u8,
        #[arg(long)]
        force: bool,
        #[arg(long = "include-path")]
        include_paths: Vec<PathBuf>,
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunFile {
    model: ModelSection,
    #[serde(default)]
    compile: Option<CompileSection>,
    #[serde(default)]
    sample: SampleRequest,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelSection {
    stan_file: PathBuf,
    #[serde(default)]
    exe_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompileSection {
    #[serde(default)]
    cmdstan: Option<PathBuf>,
    #[serde(default)]
    make: Option<String>,
    #[serde(default = "default_opt_level")]
    opt_level: u8,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    include_paths: Vec<PathBuf>,
}

fn default_opt_level() -> u8 {
    2
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(command_quiet(&cli.command));
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let (code, details) = error_details(&err);
                emit_json(&json_error(code, err.to_string(), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(quiet: bool) {
    let default = if quiet {
        "chain_runner=warn"
    } else {
        "chain_runner=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            run_file,
            cmdstan,
            cores,
            json,
            ..
        } => {
            let mut run = load_run_file(&run_file)?;
            if let Some(cores) = cores {
                run.sample.cores = cores;
            }
            let model = prepare_model(&run, cmdstan)?;
            let result = chain_runner::sample(&model, &run.sample, &RunSettings::detect())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "model": model_to_json(&model),
                    "run": run_result_to_json(&result)?,
                })));
            }
            print_model(&model);
            print_run(&result);
        }
        Commands::Describe { run_file, json } => {
            let run = load_run_file(&run_file)?;
            let model = Model::new(&run.model.stan_file, run.model.exe_file.clone())?;
            let config = RunConfig::validate(
                &run.sample,
                model.name(),
                model.exe_file().map(Path::to_path_buf),
                &RunSettings::detect(),
            )?;
            let chains = build_all(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "model": model_to_json(&model),
                    "chains": config.chains(),
                    "cores": config.cores(),
                    "requested_cores": config.requested_cores(),
                    "output_basename": config.output_basename().display().to_string(),
                    "commands": chains.iter().map(|(_, inv)| inv.argv()).collect::<Vec<_>>(),
                })));
            }
            print_model(&model);
            println!("chains: {}", config.chains());
            println!("cores: {}", config.cores());
            if config.cores() != config.requested_cores() {
                println!("requested_cores: {}", config.requested_cores());
            }
            println!("output_basename: {}", config.output_basename().display());
            for (chain, invocation) in &chains {
                println!("chain {}: {}", chain.chain_id, invocation.command_line());
            }
        }
        Commands::Compile {
            stan_file,
            cmdstan,
            opt_level,
            force,
            include_paths,
            json,
            ..
        } => {
            let mut model = Model::new(&stan_file, None)?;
            let toolchain = resolve_toolchain(cmdstan, None)?
                .ok_or_else(|| anyhow!("no toolchain: pass --cmdstan or set CMDSTAN"))?;
            let options = CompileOptions {
                opt_level,
                overwrite: force,
                include_paths,
            };
            model.compile(&toolchain, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "compile",
                    "model": model_to_json(&model),
                    "toolchain": toolchain.root.display().to_string(),
                })));
            }
            print_model(&model);
        }
    }
    Ok(None)
}

fn load_run_file(path: &Path) -> Result<RunFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read run file {}", path.display()))?;
    let mut run: RunFile = serde_yaml::from_str(&text)
        .with_context(|| format!("invalid run file {}", path.display()))?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    rebase_paths(&mut run, base);
    Ok(run)
}

/// Paths in a run file are relative to the file itself.
fn rebase_paths(run: &mut RunFile, base: &Path) {
    rebase(&mut run.model.stan_file, base);
    if let Some(exe) = run.model.exe_file.as_mut() {
        rebase(exe, base);
    }
    if let Some(compile) = run.compile.as_mut() {
        if let Some(root) = compile.cmdstan.as_mut() {
            rebase(root, base);
        }
        for path in compile.include_paths.iter_mut() {
            rebase(path, base);
        }
    }
    let sample = &mut run.sample;
    if let Some(basename) = sample.csv_basename.as_mut() {
        rebase(basename, base);
    }
    if let Some(data) = sample.data.as_mut() {
        rebase_input(data, base);
    }
    if let Some(InitArg::Input(inits)) = sample.inits.as_mut() {
        rebase_input(inits, base);
    }
    match sample.metric.as_mut() {
        Some(OneOrMany::One(metric)) => rebase_metric(metric, base),
        Some(OneOrMany::Many(metrics)) => {
            for metric in metrics.iter_mut() {
                rebase_metric(metric, base);
            }
        }
        None => {}
    }
}

fn rebase(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn rebase_input(input: &mut InputArg, base: &Path) {
    match input {
        InputArg::Path(path) => rebase(path, base),
        InputArg::Paths(paths) => paths.iter_mut().for_each(|p| rebase(p, base)),
        InputArg::Mapping(_) => {}
    }
}

fn rebase_metric(metric: &mut String, base: &Path) {
    if matches!(metric.as_str(), "diag" | "diag_e" | "dense" | "dense_e") {
        return;
    }
    let mut path = PathBuf::from(metric.as_str());
    rebase(&mut path, base);
    *metric = path.display().to_string();
}

fn resolve_toolchain(
    flag: Option<PathBuf>,
    section: Option<&CompileSection>,
) -> Result<Option<Toolchain>> {
    let root = flag
        .or_else(|| section.and_then(|s| s.cmdstan.clone()))
        .or_else(|| std::env::var_os("CMDSTAN").map(PathBuf::from));
    let Some(root) = root else {
        return Ok(None);
    };
    let mut toolchain = Toolchain::new(root);
    if let Some(make) = section.and_then(|s| s.make.clone()) {
        toolchain = toolchain.with_make(make);
    }
    toolchain.validate()?;
    Ok(Some(toolchain))
}

/// Compiles when the run file asks for it or when no executable is given.
fn prepare_model(run: &RunFile, cmdstan: Option<PathBuf>) -> Result<Model> {
    let mut model = Model::new(&run.model.stan_file, run.model.exe_file.clone())?;
    let wants_compile = run.compile.is_some() || model.exe_file().is_none();
    if !wants_compile {
        return Ok(model);
    }
    let section = run.compile.as_ref();
    match resolve_toolchain(cmdstan, section)? {
        Some(toolchain) => {
            let options = CompileOptions {
                opt_level: section.map(|s| s.opt_level).unwrap_or(2),
                overwrite: section.map(|s| s.force).unwrap_or(false),
                include_paths: section
                    .map(|s| s.include_paths.clone())
                    .unwrap_or_default(),
            };
            model.compile(&toolchain, &options)?;
        }
        None if model.exe_file().is_none() => {
            return Err(anyhow!(
                "model {} has no executable: set model.exe_file, or pass --cmdstan or set CMDSTAN to compile it",
                model.name()
            ));
        }
        None => {}
    }
    Ok(model)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &anyhow::Error) -> (&'static str, Value) {
    let Some(chain_err) = err.downcast_ref::<ChainError>() else {
        return ("command_failed", json!({}));
    };
    let code = match chain_err {
        ChainError::InvalidConfig(_) => "invalid_config",
        ChainError::ChainExecution { .. } => "chain_failed",
        ChainError::OutputValidation { .. } => "invalid_output",
        ChainError::Compile(_) => "compile_failed",
        _ => "command_failed",
    };
    let details = match chain_err.run_result().map(run_result_to_json) {
        Some(Ok(run)) => json!({ "run": run }),
        _ => json!({}),
    };
    (code, details)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Compile { json, .. } => *json,
    }
}

fn command_quiet(command: &Commands) -> bool {
    match command {
        Commands::Run { quiet, .. } | Commands::Compile { quiet, .. } => *quiet,
        Commands::Describe { .. } => false,
    }
}

fn model_to_json(model: &Model) -> Value {
    json!({
        "name": model.name(),
        "stan_file": model.stan_file().display().to_string(),
        "exe_file": model.exe_file().map(|p| p.display().to_string()),
    })
}

fn run_result_to_json(result: &RunResult) -> Result<Value> {
    let mut value = result.to_json()?;
    if let Some(path) = result.summary_file() {
        value["summary_file"] = json!(path.display().to_string());
    }
    Ok(value)
}

fn print_model(model: &Model) {
    println!("model: {}", model.name());
    println!("stan_file: {}", model.stan_file().display());
    match model.exe_file() {
        Some(exe) => println!("exe_file: {}", exe.display()),
        None => println!("exe_file: none"),
    }
}

fn print_run(result: &RunResult) {
    println!("chains: {}", result.chains());
    println!("cores: {}", result.cores());
    for outcome in result.outcomes() {
        println!(
            "chain {}: {} ({} ms) {}",
            outcome.chain_id,
            outcome.status.as_str(),
            outcome.elapsed.as_millis(),
            outcome.output_file.display()
        );
    }
    if let Some(path) = result.summary_file() {
        println!("summary: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN_FILE: &str = r#"
model:
  stan_file: models/bernoulli.stan
  exe_file: /opt/models/bernoulli
compile:
  opt_level: 3
  include_paths: [include]
sample:
  chains: 2
  cores: 2
  data: data/bernoulli.json
  inits:
    - inits/a.json
    - /abs/b.json
  metric: diag
  csv_basename: out/bernoulli
"#;

    #[test]
    fn run_file_paths_are_relative_to_the_file() {
        let mut run: RunFile = serde_yaml::from_str(RUN_FILE).expect("parse");
        rebase_paths(&mut run, Path::new("/work"));
        assert_eq!(run.model.stan_file, Path::new("/work/models/bernoulli.stan"));
        assert_eq!(run.model.exe_file.as_deref(), Some(Path::new("/opt/models/bernoulli")));
        let compile = run.compile.expect("compile section");
        assert_eq!(compile.opt_level, 3);
        assert_eq!(compile.include_paths, vec![PathBuf::from("/work/include")]);
        assert_eq!(
            run.sample.csv_basename.as_deref(),
            Some(Path::new("/work/out/bernoulli"))
        );
        assert_eq!(
            run.sample.data,
            Some(InputArg::Path(PathBuf::from("/work/data/bernoulli.json")))
        );
        assert_eq!(
            run.sample.inits,
            Some(InitArg::Input(InputArg::Paths(vec![
                PathBuf::from("/work/inits/a.json"),
                PathBuf::from("/abs/b.json"),
            ])))
        );
        assert_eq!(run.sample.metric, Some(OneOrMany::One("diag".to_string())));
    }

    #[test]
    fn sample_section_defaults_when_omitted() {
        let run: RunFile =
            serde_yaml::from_str("model:\n  stan_file: m.stan\n").expect("parse");
        assert!(run.compile.is_none());
        assert_eq!(run.sample, SampleRequest::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = serde_yaml::from_str::<RunFile>("model:\n  stan_file: m.stan\nsampel: {}\n")
            .expect_err("typo");
        assert!(err.to_string().contains("sampel"), "{}", err);
    }

    #[test]
    fn chain_errors_map_to_codes() {
        let err = anyhow::Error::from(ChainError::InvalidConfig("bad".into()));
        assert_eq!(error_details(&err).0, "invalid_config");
        let err = anyhow!("plain");
        assert_eq!(error_details(&err), ("command_failed", json!({})));
        let payload = json_error("invalid_config", "bad".into(), json!({}));
        assert_eq!(payload["ok"], false);
        assert_eq!(payload["error"]["code"], "invalid_config");
    }
}
