//! Trials backed by an external shell command.
//!
//! The command runs in the trial directory with the trial described in
//! `SWEEP_*` environment variables. Exit status 0 reports the metrics found
//! on the last JSON object line of stdout, exit status 3 reports a pruned
//! trial and any other status fails with error kind `exit:<code>`.

use std::collections::BTreeMap;
use std::process::{Command, Output};

use serde_json::Value;
use sweep_core::config::TrialCommandConfig;
use sweepgrid_scheduler::{TrialBody, TrialContext, TrialError, TrialReport};
use sweepgrid_state::TrialMetrics;
use tracing::debug;

/// Exit status a trial command uses to prune itself.
pub const PRUNED_EXIT_CODE: i32 = 3;

/// Metrics key that carries the peak GPU memory instead of a metric.
const GPU_PEAK_KEY: &str = "gpu_peak_mb";

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CommandTrial {
    command: String,
    env: BTreeMap<String, String>,
}

impl From<TrialCommandConfig> for CommandTrial {
    fn from(config: TrialCommandConfig) -> Self {
        Self {
            command: config.command,
            env: config.env,
        }
    }
}

impl CommandTrial {
    fn build(&self, ctx: &TrialContext) -> Result<Command, TrialError> {
        let config = serde_json::to_string(&ctx.config)
            .map_err(|e| TrialError::new("config", e.to_string()))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&ctx.trial_dir)
            .env("SWEEP_TRIAL_ID", &ctx.trial_id)
            .env("SWEEP_TRIAL_CONFIG", config)
            .env("SWEEP_TRIAL_DIR", &ctx.trial_dir)
            .env("SWEEP_CHECKPOINT_DIR", &ctx.checkpoint_dir)
            .env("SWEEP_RESUME", if ctx.resume { "1" } else { "0" })
            .env("SWEEP_ATTEMPT", ctx.attempt.to_string());
        for (name, value) in &ctx.config {
            cmd.env(param_var(name), value.to_string());
        }
        if let Some(gpu) = &ctx.gpu {
            cmd.env("SWEEP_GPU", gpu);
            if let Some((_, index)) = gpu.rsplit_once(':') {
                cmd.env("CUDA_VISIBLE_DEVICES", index);
            }
        }
        cmd.envs(&self.env);
        Ok(cmd)
    }
}

impl TrialBody for CommandTrial {
    fn run(&self, ctx: &TrialContext) -> Result<TrialReport, TrialError> {
        std::fs::create_dir_all(&ctx.trial_dir)
            .map_err(|e| TrialError::new("io", format!("{}: {e}", ctx.trial_dir.display())))?;
        let output = self
            .build(ctx)?
            .output()
            .map_err(|e| TrialError::new("spawn", e.to_string()))?;
        debug!(
            trial_id = %ctx.trial_id,
            status = ?output.status.code(),
            "trial command exited"
        );
        interpret(&output)
    }
}

/// `SWEEP_PARAM_<NAME>` with the name upper-cased and non-alphanumerics
/// replaced by `_`.
fn param_var(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("SWEEP_PARAM_{name}")
}

fn interpret(output: &Output) -> Result<TrialReport, TrialError> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    match output.status.code() {
        Some(0) => {
            let (metrics, gpu_peak) = parse_metrics(&stdout).ok_or_else(|| {
                TrialError::new("no_metrics", "the command printed no JSON metrics line")
            })?;
            let report = TrialReport::new(metrics);
            Ok(match gpu_peak {
                Some(mb) => report.with_gpu_peak(mb),
                None => report,
            })
        }
        Some(PRUNED_EXIT_CODE) => {
            let metrics = parse_metrics(&stdout).map(|(m, _)| m).unwrap_or_default();
            Ok(TrialReport::pruned(metrics))
        }
        Some(code) => Err(TrialError::new(
            format!("exit:{code}"),
            stderr_tail(&output.stderr),
        )),
        None => Err(TrialError::new("signal", stderr_tail(&output.stderr))),
    }
}

/// Metrics from the last stdout line holding a JSON object. Numbers and
/// numeric strings (`"NaN"`, `"inf"`) are kept; other values are ignored.
fn parse_metrics(stdout: &str) -> Option<(TrialMetrics, Option<u64>)> {
    let object = stdout.lines().rev().find_map(|line| {
        match serde_json::from_str::<Value>(line.trim()) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        }
    })?;

    let mut metrics = TrialMetrics::new();
    let mut gpu_peak = None;
    for (key, value) in object {
        let number = match &value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        };
        let Some(number) = number else { continue };
        if key == GPU_PEAK_KEY {
            gpu_peak = (number.is_finite() && number >= 0.0).then(|| number.round() as u64);
        } else {
            metrics.insert(key, number);
        }
    }
    Some((metrics, gpu_peak))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
