//! Remote provider backed by the GitHub `gh` command line
//!
//! Authentication is whatever `gh auth` already has.

use chrono::{DateTime, Utc};
use issync_core::mapper::parse_remote_state;
use issync_core::remote::{NewRemoteIssue, RemoteIssueUpdate};
use issync_core::{RemoteError, RemoteIssue, RemoteProvider, RemoteState, Repository};
use serde::Deserialize;
use std::process::Command;

const ISSUE_FIELDS: &str = "number,title,body,state,labels,url,createdAt,updatedAt,closedAt";
const LIST_LIMIT: usize = 10_000;

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(default)]
    url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
}

impl From<GhIssue> for RemoteIssue {
    fn from(issue: GhIssue) -> Self {
        RemoteIssue {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            state: parse_remote_state(&issue.state),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            url: issue.url,
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            // gh reports a zero timestamp for open issues
            closed_at: issue.closed_at.filter(|t| t.timestamp() > 0),
        }
    }
}

/// `gh`-driven GitHub issues client
pub struct GhCliRemote {
    program: String,
}

impl Default for GhCliRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl GhCliRemote {
    pub fn new() -> Self {
        Self {
            program: std::env::var("ISSYNC_GH").unwrap_or_else(|_| "gh".to_string()),
        }
    }

    fn run(&self, args: &[&str], number: Option<u64>) -> Result<String, RemoteError> {
        tracing::debug!(program = %self.program, ?args, "Running gh");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| RemoteError::Api(format!("failed to run {}: {e}", self.program)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(classify_failure(
            &String::from_utf8_lossy(&output.stderr),
            number,
        ))
    }

    fn view(&self, repo: &Repository, number: u64) -> Result<RemoteIssue, RemoteError> {
        let repo = repo.to_string();
        let number_arg = number.to_string();
        let stdout = self.run(
            &["issue", "view", &number_arg, "--repo", &repo, "--json", ISSUE_FIELDS],
            Some(number),
        )?;
        let issue: GhIssue = serde_json::from_str(&stdout)
            .map_err(|e| RemoteError::Api(format!("unexpected gh output: {e}")))?;
        Ok(issue.into())
    }
}

/// Map gh's stderr onto the remote error taxonomy
fn classify_failure(stderr: &str, number: Option<u64>) -> RemoteError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("rate limit") {
        RemoteError::RateLimited
    } else if lower.contains("gh auth login") || lower.contains("authentication") || lower.contains("401") {
        RemoteError::Auth(message)
    } else if let Some(number) = number
        && (lower.contains("could not resolve") || lower.contains("not found"))
    {
        RemoteError::NotFound(number)
    } else if lower.contains("error connecting") || lower.contains("timeout") {
        RemoteError::Network(message)
    } else {
        RemoteError::Api(message)
    }
}

/// `gh` splits label arguments on commas, so such labels cannot be sent intact
fn check_labels<'a>(labels: impl IntoIterator<Item = &'a String>) -> Result<(), RemoteError> {
    match labels.into_iter().find(|l| l.contains(',')) {
        Some(label) => Err(RemoteError::Api(format!(
            "label '{label}' contains a comma, which gh cannot pass through"
        ))),
        None => Ok(()),
    }
}

/// Parse `gh issue list` output, warning when the listing hit the limit
fn parse_issue_list(stdout: &str, repo: &str) -> Result<Vec<RemoteIssue>, RemoteError> {
    let issues: Vec<GhIssue> = serde_json::from_str(stdout)
        .map_err(|e| RemoteError::Api(format!("unexpected gh output: {e}")))?;
    if issues.len() >= LIST_LIMIT {
        tracing::warn!(
            repository = %repo,
            limit = LIST_LIMIT,
            "Issue listing hit the limit; older issues were not fetched"
        );
    }
    Ok(issues.into_iter().map(Into::into).collect())
}

/// Issue number from the URL `gh issue create` prints
fn number_from_url(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().rsplit('/').next()?.parse().ok())
}

impl RemoteProvider for GhCliRemote {
    fn fetch_all(&self, repo: &Repository) -> Result<Vec<RemoteIssue>, RemoteError> {
        let repo = repo.to_string();
        let limit = LIST_LIMIT.to_string();
        let stdout = self.run(
            &[
                "issue", "list", "--repo", &repo, "--state", "all", "--limit", &limit,
                "--json", ISSUE_FIELDS,
            ],
            None,
        )?;
        parse_issue_list(&stdout, &repo)
    }

    fn create(&self, repo: &Repository, issue: &NewRemoteIssue) -> Result<RemoteIssue, RemoteError> {
        check_labels(&issue.labels)?;
        let repo_arg = repo.to_string();
        let mut args: Vec<&str> = vec![
            "issue",
            "create",
            "--repo",
            repo_arg.as_str(),
            "--title",
            issue.title.as_str(),
            "--body",
            issue.body.as_str(),
        ];
        for label in &issue.labels {
            args.push("--label");
            args.push(label.as_str());
        }
        let stdout = self.run(&args, None)?;
        let number = number_from_url(&stdout)
            .ok_or_else(|| RemoteError::Api(format!("could not parse issue URL from: {stdout}")))?;
        self.view(repo, number)
    }

    fn update(
        &self,
        repo: &Repository,
        number: u64,
        update: &RemoteIssueUpdate,
    ) -> Result<(), RemoteError> {
        check_labels(&update.labels)?;
        let current = self.view(repo, number)?;
        check_labels(current.labels.iter().filter(|l| !update.labels.contains(l)))?;
        let repo_arg = repo.to_string();
        let number_arg = number.to_string();

        let mut args: Vec<&str> = vec![
            "issue",
            "edit",
            number_arg.as_str(),
            "--repo",
            repo_arg.as_str(),
            "--title",
            update.title.as_str(),
            "--body",
            update.body.as_str(),
        ];
        for label in update.labels.iter().filter(|l| !current.labels.contains(l)) {
            args.push("--add-label");
            args.push(label.as_str());
        }
        for label in current.labels.iter().filter(|l| !update.labels.contains(l)) {
            args.push("--remove-label");
            args.push(label.as_str());
        }
        self.run(&args, Some(number))?;

        if current.state != update.state {
            let verb = match update.state {
                RemoteState::Closed => "close",
                RemoteState::Open => "reopen",
            };
            self.run(&["issue", verb, &number_arg, "--repo", &repo_arg], Some(number))?;
        }
        Ok(())
    }
}
