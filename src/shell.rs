use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use tracing::{info, warn};

#[derive(Debug)]
pub struct ShellOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Runs `script` with `sh -c` in `cwd`, adding `env` to the inherited environment.
pub fn run_script(
    script: &str,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> io::Result<ShellOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(cwd)
        .envs(env)
        .stdin(Stdio::null())
        .output()?;
    Ok(ShellOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Forwards captured output to the log, one event per line.
pub fn log_output(source: &str, output: &ShellOutput) {
    for line in output.stdout.lines() {
        info!(source, "{line}");
    }
    for line in output.stderr.lines() {
        warn!(source, "{line}");
    }
}

/// Joins commands into one script that stops at the first failing command.
pub fn script(commands: &[String]) -> String {
    let mut script = String::from("set -e\n");
    for command in commands {
        script.push_str(command);
        script.push('\n');
    }
    script
}
