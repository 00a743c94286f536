use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{RunConfig, RunSettings, SampleRequest};
use crate::error::Result;
use crate::invocation::build_all;
use crate::model::Model;
use crate::outcome::RunResult;
use crate::pool::run_chains_in_pool;

pub fn summary_path(basename: &Path) -> PathBuf {
    PathBuf::from(format!("{}-run.json", basename.display()))
}

/// Builds every invocation, runs them all and returns the outcomes without
/// judging them. Configuration errors surface before any process starts.
pub fn run_chains(config: &RunConfig) -> Result<RunResult> {
    let chains = build_all(config)?;
    let outcomes = run_chains_in_pool(&chains, config.cores());
    let mut result = RunResult::new(outcomes, config.cores());
    let summary = summary_path(config.output_basename());
    if let Err(err) = result.write_summary(&summary) {
        warn!(path = %summary.display(), error = %err, "could not write run summary");
    }
    info!(
        chains = result.chains(),
        failed = result.failures().len(),
        "all chains finished"
    );
    Ok(result)
}

pub fn sample(model: &Model, request: &SampleRequest, settings: &RunSettings) -> Result<RunResult> {
    let config = RunConfig::validate(
        request,
        model.name(),
        model.exe_file().map(Path::to_path_buf),
        settings,
    )?;
    let result = run_chains(&config)?;
    result.ensure_success()?;
    Ok(result)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{InputArg, OneOrMany};
    use crate::error::ChainError;
    use crate::outcome::ChainStatus;
    use serde_json::{json, Map, Value};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    // Writes a CSV with a header and one draw to the `output file=` argument.
    const WRITE_DRAWS: &str = r#"out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "output" ]; then out="${a#file=}"; fi
  prev="$a"
done
"#;

    struct Bench {
        dir: tempfile::TempDir,
        model: Model,
    }

    impl Bench {
        fn new(script_body: &str) -> Self {
            let dir = tempfile::tempdir().expect("temp dir");
            let stan = dir.path().join("stub.stan");
            fs::write(&stan, "").expect("stan file");
            let exe = dir.path().join("stub");
            fs::write(&exe, format!("#!/bin/sh\n{}{}", WRITE_DRAWS, script_body)).expect("exe");
            fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");
            let model = Model::new(&stan, Some(exe)).expect("model");
            Self { dir, model }
        }

        fn settings(&self, cores: usize) -> RunSettings {
            RunSettings::detect()
                .with_tmp_dir(self.dir.path().join("tmp"))
                .with_available_cores(cores)
        }

        fn request(&self, chains: i64, cores: i64) -> SampleRequest {
            SampleRequest {
                chains,
                cores,
                seed: Some(OneOrMany::One(1234)),
                csv_basename: Some(self.dir.path().join("out")),
                ..SampleRequest::default()
            }
        }

        fn files_with_extension(&self, ext: &str) -> Vec<PathBuf> {
            fs::read_dir(self.dir.path())
                .expect("read dir")
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
                .collect()
        }
    }

    const GOOD: &str = "printf '# stub\\nlp__,theta\\n-1.5,0.25\\n' > \"$out\"\necho \"args: $*\"\n";

    #[test]
    fn trivial_chains_all_succeed() {
        for chains in [1, 3, 5] {
            let bench = Bench::new(GOOD);
            let result = sample(&bench.model, &bench.request(chains, 2), &bench.settings(4))
                .expect("sampling succeeds");
            assert_eq!(result.chains(), chains as usize);
            assert!(result.exit_codes().iter().all(|c| *c == Some(0)));
            assert!(result.all_succeeded());
            for outcome in result.outcomes() {
                let transcript = fs::read_to_string(&outcome.transcript_file).expect("transcript");
                assert!(
                    transcript.contains(&format!("id={}", outcome.chain_id)),
                    "{}",
                    transcript
                );
                assert!(!transcript.contains("ERROR"));
            }
            let summary = result.summary_file().expect("summary written");
            let value: Value =
                serde_json::from_slice(&fs::read(summary).expect("read")).expect("json");
            assert_eq!(value["chains"], chains);
        }
    }

    #[test]
    fn processes_never_exceed_effective_concurrency() {
        let bench = Bench::new("");
        let state = bench.dir.path().join("state");
        fs::create_dir_all(state.join("running")).expect("state dir");
        let script = format!(
            "{}touch \"{s}/running/$$\"\nsleep 0.3\nls \"{s}/running\" | wc -l >> \"{s}/counts\"\nrm \"{s}/running/$$\"\n{}",
            WRITE_DRAWS,
            GOOD,
            s = state.display()
        );
        let exe = bench.model.exe_file().expect("exe").to_path_buf();
        fs::write(&exe, format!("#!/bin/sh\n{}", script)).expect("rewrite stub");

        let result = sample(&bench.model, &bench.request(6, 2), &bench.settings(8))
            .expect("sampling succeeds");
        assert_eq!(result.cores(), 2);
        let counts = fs::read_to_string(state.join("counts")).expect("counts");
        let counts: Vec<usize> = counts
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        assert_eq!(counts.len(), 6);
        assert!(counts.iter().all(|c| *c >= 1 && *c <= 2), "{:?}", counts);
    }

    #[test]
    fn failing_chain_does_not_stop_siblings() {
        let body = format!(
            "case \" $* \" in *\" id=2 \"*) echo 'bad input' >&2; exit 3;; esac\n{}",
            GOOD
        );
        let bench = Bench::new(&body);
        let err = sample(&bench.model, &bench.request(4, 2), &bench.settings(4))
            .expect_err("chain 2 fails");
        let msg = err.to_string();
        assert!(msg.contains("chain 2 returned error code 3"), "{}", msg);
        let result = err.run_result().expect("result attached");
        assert_eq!(result.chains(), 4);
        assert_eq!(
            result.exit_codes(),
            vec![Some(0), Some(3), Some(0), Some(0)]
        );
        match &err {
            ChainError::ChainExecution { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].chain_id, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        let transcript =
            fs::read_to_string(&result.outcomes()[1].transcript_file).expect("transcript");
        assert!(transcript.ends_with("ERROR\nbad input\n"), "{}", transcript);
    }

    #[test]
    fn mismatched_lists_fail_before_spawning() {
        let bench = Bench::new(GOOD);
        let request = SampleRequest {
            seed: Some(OneOrMany::Many(vec![1, 2])),
            ..bench.request(3, 1)
        };
        let err = sample(&bench.model, &request, &bench.settings(2)).expect_err("mismatch");
        assert!(err.is_invalid_config(), "{}", err);
        assert!(bench.files_with_extension("txt").is_empty());
        assert!(bench.files_with_extension("csv").is_empty());
    }

    #[test]
    fn inline_data_is_passed_as_a_resolved_file() {
        let bench = Bench::new("for a in \"$@\"; do echo \"$a\"; done\nprintf 'x\\n1\\n' > \"$out\"\n");
        let mut values = Map::new();
        values.insert("x".into(), json!(1));
        let request = SampleRequest {
            data: Some(InputArg::Mapping(values)),
            ..bench.request(2, 2)
        };
        let result = sample(&bench.model, &request, &bench.settings(2)).expect("sampling");
        for outcome in result.outcomes() {
            let transcript = fs::read_to_string(&outcome.transcript_file).expect("transcript");
            let lines: Vec<&str> = transcript.lines().collect();
            let at = lines
                .iter()
                .position(|l| *l == "data")
                .expect("data argument present");
            let path = lines[at + 1]
                .strip_prefix("file=")
                .expect("file= follows data");
            let value: Value =
                serde_json::from_slice(&fs::read(path).expect("temp data file")).expect("json");
            assert_eq!(value, json!({"x": 1}));
            assert!(lines.contains(&format!("id={}", outcome.chain_id).as_str()));
        }
    }

    #[test]
    fn header_only_output_fails_validation() {
        let body = format!(
            "case \" $* \" in *\" id=2 \"*) printf 'lp__,theta\\n' > \"$out\"; exit 0;; esac\n{}",
            GOOD
        );
        let bench = Bench::new(&body);
        let err = sample(&bench.model, &bench.request(3, 3), &bench.settings(3))
            .expect_err("invalid output");
        match &err {
            ChainError::OutputValidation { chain_id, path, .. } => {
                assert_eq!(*chain_id, 2);
                assert_eq!(path, &bench.dir.path().join("out-2.csv"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(err.run_result().map(RunResult::all_succeeded).unwrap_or(false));
    }

    #[test]
    fn unlaunchable_executable_is_recorded_per_chain() {
        let bench = Bench::new(GOOD);
        let exe = bench.model.exe_file().expect("exe").to_path_buf();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o644)).expect("chmod");
        let err = sample(&bench.model, &bench.request(2, 2), &bench.settings(2))
            .expect_err("cannot spawn");
        let result = err.run_result().expect("result attached");
        assert_eq!(result.chains(), 2);
        for outcome in result.outcomes() {
            assert!(matches!(outcome.status, ChainStatus::SpawnFailed(_)));
            assert!(outcome.transcript_file.exists());
        }
        assert!(err.to_string().contains("chain 1 failed to start"), "{}", err);
        assert!(err.to_string().contains("chain 2 failed to start"), "{}", err);
    }

    #[test]
    fn concurrency_request_is_clamped_not_rejected() {
        let bench = Bench::new(GOOD);
        let result = sample(&bench.model, &bench.request(3, 64), &bench.settings(2))
            .expect("clamped run");
        assert_eq!(result.cores(), 2);
        assert_eq!(result.chains(), 3);
    }

    #[test]
    fn uncompiled_model_cannot_be_scheduled() {
        let dir = tempfile::tempdir().expect("temp dir");
        let stan = dir.path().join("m.stan");
        fs::write(&stan, "").expect("stan");
        let model = Model::new(&stan, None).expect("model");
        let request = SampleRequest {
            csv_basename: Some(dir.path().join("out")),
            ..SampleRequest::default()
        };
        let settings = RunSettings::detect().with_tmp_dir(dir.path());
        let err = sample(&model, &request, &settings).expect_err("no exe");
        assert!(err.is_invalid_config());
        assert!(!dir.path().join("out-1.txt").exists());
    }
}
