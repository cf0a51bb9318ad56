//! Built-in `exec` and `deploy_file` command implementations

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::{Map, Value};
use tokio::process::Command as Process;

/// Allow-list gate and runner for the `exec` command.
///
/// Matching is on the executable token only: it must equal an allowed
/// prefix or start with one. No shell is involved, so arguments are never
/// interpreted.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    allowed_prefixes: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ExecPolicy {
    #[must_use]
    pub fn new(allowed_prefixes: Vec<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            allowed_prefixes,
            working_dir: working_dir.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn is_allowed(&self, command_line: &str) -> bool {
        let Some(program) = command_line.split_whitespace().next() else {
            return false;
        };
        self.allowed_prefixes
            .iter()
            .filter(|prefix| !prefix.is_empty())
            .any(|prefix| program.starts_with(prefix.as_str()))
    }

    /// Run an allowed command line and capture its output.
    ///
    /// Callers check `is_allowed` first.
    pub async fn run(&self, command_line: &str) -> anyhow::Result<Map<String, Value>> {
        let argv: Vec<String> = command_line.split_whitespace().map(str::to_string).collect();
        run_process(&argv, &self.working_dir, self.timeout).await
    }
}

/// Spawn `argv` without a shell, wait up to `limit`, and report stdout,
/// stderr, exit code and success
pub(crate) async fn run_process(
    argv: &[String],
    working_dir: &Path,
    limit: Duration,
) -> anyhow::Result<Map<String, Value>> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };

    let mut process = Process::new(program);
    process
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if working_dir.is_dir() {
        process.current_dir(working_dir);
    } else {
        tracing::warn!(dir = %working_dir.display(), "Working directory missing, using current directory");
    }

    let output = tokio::time::timeout(limit, process.output())
        .await
        .map_err(|_| anyhow::anyhow!("command timed out after {}s", limit.as_secs()))?
        .with_context(|| format!("failed to spawn '{program}'"))?;

    let mut result = Map::new();
    result.insert(
        "stdout".into(),
        Value::String(String::from_utf8_lossy(&output.stdout).into_owned()),
    );
    result.insert(
        "stderr".into(),
        Value::String(String::from_utf8_lossy(&output.stderr).into_owned()),
    );
    result.insert(
        "exit_code".into(),
        output.status.code().map_or(Value::Null, Value::from),
    );
    result.insert("success".into(), Value::Bool(output.status.success()));
    Ok(result)
}

/// Resolve a deploy target, refusing any path that climbs with `..`
pub fn resolve_deploy_path(app_dir: &Path, path: &str) -> anyhow::Result<PathBuf> {
    let requested = Path::new(path);
    if path.is_empty() {
        bail!("path is empty");
    }
    if requested.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("path '{path}' must not contain '..'");
    }
    Ok(if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        app_dir.join(requested)
    })
}

/// Write `content` to `path`, creating parent directories
pub async fn deploy_file(app_dir: &Path, path: &str, content: &str) -> anyhow::Result<Map<String, Value>> {
    let target = resolve_deploy_path(app_dir, path)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&target, content)
        .await
        .with_context(|| format!("failed to write {}", target.display()))?;

    tracing::info!(path = %target.display(), bytes = content.len(), "Deployed file");

    let mut result = Map::new();
    result.insert("path".into(), Value::String(target.display().to_string()));
    result.insert("bytes".into(), Value::from(content.len()));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(prefixes: &[&str]) -> ExecPolicy {
        ExecPolicy::new(
            prefixes.iter().map(|p| (*p).to_string()).collect(),
            std::env::temp_dir(),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_allow_list_matches_executable_only() {
        let policy = policy(&["docker", "systemctl"]);
        assert!(policy.is_allowed("docker ps -a"));
        assert!(policy.is_allowed("docker-compose up"));
        assert!(policy.is_allowed("systemctl status nginx"));
        assert!(!policy.is_allowed("rm -rf /"));
        assert!(!policy.is_allowed("/usr/bin/docker ps"));
        assert!(!policy.is_allowed("echo docker"));
        assert!(!policy.is_allowed("   "));
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let policy = policy(&["echo"]);
        let out = policy.run("echo hello world").await.unwrap();
        assert_eq!(out["stdout"], "hello world\n");
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["success"], true);
    }

    #[tokio::test]
    async fn test_run_reports_missing_program() {
        let policy = policy(&["definitely-not"]);
        assert!(policy.run("definitely-not-a-real-binary").await.is_err());
    }

    #[test]
    fn test_deploy_path_rejects_parent_components() {
        let app = Path::new("/opt/app");
        assert!(resolve_deploy_path(app, "../etc/passwd").is_err());
        assert!(resolve_deploy_path(app, "conf/../../x").is_err());
        assert_eq!(
            resolve_deploy_path(app, "conf/app.toml").unwrap(),
            PathBuf::from("/opt/app/conf/app.toml")
        );
    }

    #[tokio::test]
    async fn test_deploy_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let out = deploy_file(dir.path(), "conf/nested/app.env", "PORT=8000\n")
            .await
            .unwrap();

        let written = std::fs::read_to_string(dir.path().join("conf/nested/app.env")).unwrap();
        assert_eq!(written, "PORT=8000\n");
        assert_eq!(out["bytes"], 10);
    }
}
