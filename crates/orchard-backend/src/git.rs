//! Git VCS driver.
//!
//! Host checkouts spawn the `git` binary with shallow clones; `pull/<n>`
//! branches fetch the pull-request head instead of cloning a named branch.
//! Credentials are embedded in the clone URL and stripped from every
//! command line before it is reported.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use orchard_core::{OrchardError, OrchardResult, OutputChunk};

use crate::progress::ProgressSink;
use crate::vcs::{RepoRef, Vcs};

const DEFAULT_HOSTNAME: &str = "github.com";

pub struct GitVcs {
    http: reqwest::Client,
}

impl GitVcs {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn hostname<'a>(&self, repo: &'a RepoRef) -> &'a str {
        repo.credentials
            .hostname
            .as_deref()
            .unwrap_or(DEFAULT_HOSTNAME)
    }

    fn token(&self, repo: &RepoRef) -> Option<String> {
        repo.credentials
            .auth_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|token| !token.is_empty())
    }

    fn clone_url(&self, repo: &RepoRef) -> String {
        let host = self.hostname(repo);
        match self.token(repo) {
            Some(token) => format!("https://{token}@{host}/{}.git", repo.repository_path),
            None => format!("https://{host}/{}.git", repo.repository_path),
        }
    }

    /// Raw-content URL for a single file on the branch.
    fn raw_file_url(&self, repo: &RepoRef, file_name: &str) -> String {
        let host = self.hostname(repo);
        if host == DEFAULT_HOSTNAME {
            format!(
                "https://raw.githubusercontent.com/{}/{}/{file_name}",
                repo.repository_path, repo.branch
            )
        } else {
            format!(
                "https://{host}/raw/{}/{}/{file_name}",
                repo.repository_path, repo.branch
            )
        }
    }

    /// Run one git command, report its output, and fail on nonzero exit.
    async fn run_git(
        &self,
        args: &[&str],
        token: &Option<String>,
        progress: &ProgressSink,
    ) -> OrchardResult<()> {
        let display = redact(&format!("git {}", args.join(" ")), token);
        debug!(command = %display, "running git");

        let start = Instant::now();
        let mut child = tokio::process::Command::new("git")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchardError::backend(format!("failed to spawn git: {e}")))?;

        if let Some(pid) = child.id() {
            progress.process_id(pid).await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OrchardError::backend(format!("git did not exit: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = redact(&String::from_utf8_lossy(&output.stderr), token);
        let exit_code = output.status.code().map(i64::from);

        progress
            .chunk(OutputChunk {
                command: Some(display.clone()),
                stdout: (!stdout.is_empty()).then_some(stdout),
                stderr: (!stderr.is_empty()).then_some(stderr.clone()),
                duration_ms: Some(start.elapsed().as_millis() as u64),
                exit_code,
            })
            .await;

        if output.status.success() {
            Ok(())
        } else {
            Err(OrchardError::Backend {
                message: format!("{display} failed: {}", stderr.trim()),
                exit_code,
            })
        }
    }
}

impl Default for GitVcs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn checkout(
        &self,
        repo: &RepoRef,
        dest_dir: &Path,
        progress: &ProgressSink,
    ) -> OrchardResult<()> {
        let token = self.token(repo);
        let url = self.clone_url(repo);
        let dest = dest_dir.to_string_lossy().into_owned();

        if let Some(number) = repo.branch.strip_prefix("pull/") {
            let local = format!("preview-pr-{number}");
            let pr_ref = format!("pull/{number}/head:{local}");
            self.run_git(&["clone", "--depth", "1", &url, &dest], &token, progress)
                .await?;
            self.run_git(
                &["-C", &dest, "fetch", "--depth", "1", "origin", &pr_ref],
                &token,
                progress,
            )
            .await?;
            self.run_git(&["-C", &dest, "checkout", &local], &token, progress)
                .await?;
        } else {
            self.run_git(
                &["clone", "--depth", "1", "-b", &repo.branch, &url, &dest],
                &token,
                progress,
            )
            .await?;
        }

        Ok(())
    }

    fn cluster_checkout_commands(&self, repo: &RepoRef) -> Vec<String> {
        let url = self.clone_url(repo);
        let checkout_dir = &repo.repository_path;
        let work_dir = match &repo.mono_repo_path {
            Some(sub) => format!("{checkout_dir}/{sub}"),
            None => checkout_dir.clone(),
        };

        let mut commands = vec!["mkdir -p /workspace".to_string(), "cd /workspace".to_string()];
        if let Some(number) = repo.branch.strip_prefix("pull/") {
            let local = format!("preview-pr-{number}");
            commands.push(format!("git clone --depth 1 {url} '{checkout_dir}'"));
            commands.push(format!("cd '{checkout_dir}'"));
            commands.push(format!(
                "git fetch --depth 1 origin pull/{number}/head:{local}"
            ));
            commands.push(format!("git checkout {local}"));
            commands.push("cd /workspace".to_string());
        } else {
            commands.push(format!(
                "git clone --depth 1 -b '{}' {url} '{checkout_dir}'",
                repo.branch
            ));
        }
        commands.push(format!("cd '/workspace/{work_dir}'"));
        commands
    }

    async fn fetch_config_file(&self, repo: &RepoRef, file_name: &str) -> OrchardResult<String> {
        let url = self.raw_file_url(repo, file_name);
        let mut request = self.http.get(&url);
        if let Some(token) = self.token(repo) {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| OrchardError::backend(format!("config fetch failed: {e}")))?;

        match response.status() {
            status if status.is_success() => response
                .text()
                .await
                .map_err(|e| OrchardError::backend(format!("config fetch failed: {e}"))),
            reqwest::StatusCode::NOT_FOUND => Err(OrchardError::NotFound(format!(
                "{file_name} not found on {}/{}",
                repo.repository_path, repo.branch
            ))),
            status => Err(OrchardError::backend(format!(
                "config fetch returned {status} for {file_name}"
            ))),
        }
    }
}

/// Strip an embedded token from reported text.
fn redact(text: &str, token: &Option<String>) -> String {
    match token {
        Some(token) if !token.is_empty() => text.replace(token.as_str(), "***"),
        _ => text.to_string(),
    }
}
