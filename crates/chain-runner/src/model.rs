use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::error::{ChainError, Result};

/// Root of an external toolchain installation (`bin/stanc` plus its makefile).
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub root: PathBuf,
    pub make: String,
}

impl Toolchain {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            make: "make".to_string(),
        }
    }

    pub fn with_make(mut self, make: impl Into<String>) -> Self {
        self.make = make.into();
        self
    }

    pub fn stanc(&self) -> PathBuf {
        self.root
            .join("bin")
            .join(format!("stanc{}", std::env::consts::EXE_SUFFIX))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(ChainError::invalid(format!(
                "toolchain directory not found: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub opt_level: u8,
    pub overwrite: bool,
    pub include_paths: Vec<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 2,
            overwrite: false,
            include_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    name: String,
    stan_file: PathBuf,
    exe_file: Option<PathBuf>,
}

impl Model {
    pub fn new(stan_file: impl Into<PathBuf>, exe_file: Option<PathBuf>) -> Result<Self> {
        let stan_file = stan_file.into();
        if !stan_file.is_file() {
            return Err(ChainError::invalid(format!(
                "no such file {}",
                stan_file.display()
            )));
        }
        let name = match (
            stan_file.extension().and_then(|s| s.to_str()),
            stan_file.file_stem().and_then(|s| s.to_str()),
        ) {
            (Some("stan"), Some(stem)) if !stem.is_empty() => stem.to_string(),
            _ => {
                return Err(ChainError::invalid(format!(
                    "invalid stan filename {}",
                    stan_file.display()
                )))
            }
        };
        if let Some(exe) = &exe_file {
            if !exe.is_file() {
                return Err(ChainError::invalid(format!("no such file {}", exe.display())));
            }
            let exe_name = exe.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            if exe_name != name {
                return Err(ChainError::invalid(format!(
                    "name mismatch between Stan file and compiled executable, expecting basename: {} found: {}",
                    name, exe_name
                )));
            }
        }
        Ok(Self {
            name,
            stan_file,
            exe_file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stan_file(&self) -> &Path {
        &self.stan_file
    }

    pub fn exe_file(&self) -> Option<&Path> {
        self.exe_file.as_deref()
    }

    pub fn code(&self) -> Result<String> {
        Ok(fs::read_to_string(&self.stan_file)?)
    }

    /// Translates the program to C++ and builds the executable.
    ///
    /// The executable path is only recorded once `make` has succeeded and the
    /// binary exists, so a failed build never leaves a stale path behind.
    pub fn compile(&mut self, toolchain: &Toolchain, options: &CompileOptions) -> Result<()> {
        if self.exe_file.is_some() && !options.overwrite {
            info!(model = %self.name, "model is already compiled");
            return Ok(());
        }
        toolchain.validate()?;
        let bad: Vec<String> = options
            .include_paths
            .iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !bad.is_empty() {
            return Err(ChainError::invalid(format!(
                "invalid include paths: {}",
                bad.join(", ")
            )));
        }

        let hpp_file = self.stan_file.with_extension("hpp");
        if options.overwrite || !hpp_file.exists() {
            let mut cmd = Command::new(toolchain.stanc());
            cmd.arg(format!("--o={}", hpp_file.display()));
            cmd.arg(&self.stan_file);
            if !options.include_paths.is_empty() {
                let joined = options
                    .include_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                cmd.arg(format!("--include_paths={}", joined));
            }
            info!(hpp = %hpp_file.display(), "translating model");
            run_tool(cmd, "stanc")?;
            if !hpp_file.exists() {
                return Err(ChainError::Compile(format!(
                    "stanc did not produce {}",
                    hpp_file.display()
                )));
            }
        }

        let stan_abs = self.stan_file.canonicalize()?;
        let exe_file = PathBuf::from(format!(
            "{}{}",
            stan_abs.with_extension("").display(),
            std::env::consts::EXE_SUFFIX
        ));
        let mut cmd = Command::new(&toolchain.make);
        cmd.arg(format!("O={}", options.opt_level));
        cmd.arg(&exe_file);
        cmd.current_dir(&toolchain.root);
        info!(exe = %exe_file.display(), "compiling model");
        run_tool(cmd, "make")?;
        if !exe_file.is_file() {
            return Err(ChainError::Compile(format!(
                "make did not produce {}",
                exe_file.display()
            )));
        }
        self.exe_file = Some(exe_file);
        Ok(())
    }
}

fn run_tool(mut cmd: Command, tool: &str) -> Result<()> {
    debug!(command = ?cmd, "running {}", tool);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let output = cmd
        .output()
        .map_err(|e| ChainError::Compile(format!("failed to run {}: {}", tool, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(ChainError::Compile(format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            detail.trim()
        )));
    }
    Ok(())
}
