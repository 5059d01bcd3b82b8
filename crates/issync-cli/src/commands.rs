//! CLI command implementations

use anyhow::{Result, bail};
use chrono::Utc;
use colored::Colorize;
use issync_core::issue::validate_labels;
use issync_core::{
    Config, Issue, IssueFilter, Repository, State, Store, SyncDirection, SyncEngine, SyncOptions,
    SyncResult, SyncStatus,
};
use std::path::Path;
use std::sync::Arc;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::gh::GhCliRemote;

const TITLE_COLUMN_WIDTH: usize = 60;

/// Open the store above the current directory and its config
fn open() -> Result<(Arc<Store>, Config)> {
    let cwd = std::env::current_dir()?;
    let store = Store::discover(&cwd)?;
    let config = Config::load(&store.config_path())?;
    if !config.display.colors {
        colored::control::set_override(false);
    }
    Ok((Arc::new(store), config))
}

fn print_issue(issue: &Issue, json: bool, message: &str) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(issue)?);
    } else {
        println!("{} {} #{}", "✓".green(), message, issue.local_id);
    }
    Ok(())
}

pub fn init(repo: Option<String>) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let store = Store::init(&cwd)?;

    if let Some(repo) = repo {
        let repo: Repository = repo.parse()?;
        let config_path = store.config_path();
        let mut config = Config::load(&config_path)?;
        config.sync.repository = Some(repo);
        config.save(&config_path)?;
    }

    println!(
        "{} Initialized issync in {}",
        "✓".green(),
        store.dir().display()
    );
    Ok(())
}

/// Create an issue with its labels; nothing is written if any input is invalid
fn create_issue(store: &Store, title: &str, body: &str, labels: Vec<String>) -> Result<Issue> {
    validate_labels(&labels)?;
    let issue = store.add(title, body)?;
    if labels.is_empty() {
        return Ok(issue);
    }
    Ok(store.update_labels(issue.local_id, labels)?)
}

pub fn add(title: &str, body: &str, labels: Vec<String>, json: bool) -> Result<()> {
    let (store, config) = open()?;
    let issue = create_issue(&store, title, body, labels)?;

    if json {
        println!("{}", serde_json::to_string(&issue)?);
    } else {
        println!("{} Created issue #{}", "✓".green(), issue.local_id);
        println!("  Title: {}", issue.title);
    }

    auto_sync(&store, config);
    Ok(())
}

#[derive(Tabled)]
struct IssueRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Remote")]
    remote: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Labels")]
    labels: String,
    #[tabled(rename = "Sync")]
    sync: String,
}

impl From<&Issue> for IssueRow {
    fn from(issue: &Issue) -> Self {
        let sync = if issue.remote_id.is_none() {
            "local".to_string()
        } else {
            issue.sync_status.to_string()
        };
        Self {
            id: issue.local_id,
            remote: issue
                .remote_id
                .map(|n| format!("#{n}"))
                .unwrap_or_else(|| "-".to_string()),
            state: issue.state.to_string(),
            title: truncate(&issue.title, TITLE_COLUMN_WIDTH),
            labels: issue.labels.iter().cloned().collect::<Vec<_>>().join(", "),
            sync,
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn build_filter(state: Option<String>, label: Option<String>, unsynced: bool) -> Result<IssueFilter> {
    let mut filter = IssueFilter::all();
    if let Some(state) = state {
        filter = filter.state(state.parse()?);
    }
    if let Some(label) = label {
        filter = filter.label(label);
    }
    if unsynced {
        filter = filter.needs_push();
    }
    Ok(filter)
}

pub fn list(state: Option<String>, label: Option<String>, unsynced: bool, json: bool) -> Result<()> {
    let (store, _) = open()?;
    let issues = store.list(&build_filter(state, label, unsynced)?);

    if json {
        println!("{}", serde_json::to_string(&issues)?);
    } else if issues.is_empty() {
        println!("No issues found");
    } else {
        let mut table = Table::new(issues.iter().map(IssueRow::from));
        table.with(Style::rounded());
        println!("{table}");
    }

    Ok(())
}

pub fn show(id: u64, json: bool) -> Result<()> {
    let (store, config) = open()?;
    let issue = store.get(id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&issue)?);
        return Ok(());
    }

    let fmt = config.display.date_format.as_str();
    println!("{} {}", format!("#{}", issue.local_id).cyan().bold(), issue.title.bold());
    println!();
    println!("State:    {}", issue.state);
    match issue.remote_id {
        Some(number) => match &config.sync.repository {
            Some(repo) => println!("Remote:   {repo}#{number}"),
            None => println!("Remote:   #{number}"),
        },
        None => println!("Remote:   {}", "not pushed".dimmed()),
    }
    let status = match issue.sync_status {
        SyncStatus::Synced => "synced".green(),
        SyncStatus::Syncing => "syncing".yellow(),
        SyncStatus::Error => "error".red(),
    };
    println!("Sync:     {status}");
    if !issue.labels.is_empty() {
        let labels: Vec<_> = issue.labels.iter().map(String::as_str).collect();
        println!("Labels:   {}", labels.join(", "));
    }
    println!("Created:  {}", issue.created_at.format(fmt));
    println!("Updated:  {}", issue.updated_at.format(fmt));
    if let Some(synced) = issue.last_synced_at {
        println!("Synced:   {}", synced.format(fmt));
    }
    if let Some(ref err) = issue.sync_error {
        println!("{}   {}", "Error:".red(), err);
    }
    if !issue.body.is_empty() {
        println!();
        println!("{}", issue.body);
    }

    Ok(())
}

pub fn update(
    id: u64,
    title: Option<String>,
    body: Option<String>,
    state: Option<String>,
    json: bool,
) -> Result<()> {
    if title.is_none() && body.is_none() && state.is_none() {
        bail!("Nothing to update; pass --title, --body or --state");
    }
    let (store, config) = open()?;

    // Validate everything before the first write
    let state: Option<State> = state.map(|s| s.parse()).transpose()?;
    let mut issue = store.get(id)?;
    if let Some(title) = title {
        issue = store.update_title(id, &title)?;
    }
    if let Some(body) = body {
        issue = store.update_body(id, &body)?;
    }
    if let Some(state) = state {
        issue = store.update_state(id, state)?;
    }

    print_issue(&issue, json, "Updated")?;
    auto_sync(&store, config);
    Ok(())
}

pub fn label_add(id: u64, label: &str, json: bool) -> Result<()> {
    let (store, config) = open()?;
    let issue = store.add_label(id, label)?;
    print_issue(&issue, json, &format!("Labeled '{label}'"))?;
    auto_sync(&store, config);
    Ok(())
}

pub fn label_rm(id: u64, label: &str, json: bool) -> Result<()> {
    let (store, config) = open()?;
    let issue = store.remove_label(id, label)?;
    print_issue(&issue, json, &format!("Removed label '{label}' from"))?;
    auto_sync(&store, config);
    Ok(())
}

pub fn set_state(id: u64, state: State, json: bool) -> Result<()> {
    let (store, config) = open()?;
    let issue = store.update_state(id, state)?;
    let verb = if state.is_closed() { "Closed" } else { "Reopened" };
    print_issue(&issue, json, verb)?;
    auto_sync(&store, config);
    Ok(())
}

pub fn remove(id: u64, json: bool) -> Result<()> {
    let (store, _) = open()?;
    let issue = store.remove(id)?;

    if json {
        println!("{}", serde_json::to_string(&issue)?);
    } else {
        println!("{} Removed #{}", "✓".green(), issue.local_id);
        if let Some(number) = issue.remote_id {
            println!("  Remote issue #{number} is left untouched");
        }
    }
    Ok(())
}

/// Run a sync with the `gh` provider and record the bookmark on success
fn run_sync(
    store: Arc<Store>,
    config: &mut Config,
    config_path: &Path,
    direction: SyncDirection,
) -> Result<SyncResult> {
    let repository = config.repository()?.clone();
    let engine = SyncEngine::new(store, GhCliRemote::new(), SyncOptions::new(repository));
    let result = engine.run(direction)?;

    if result.success && !result.cancelled {
        config.sync.last_synced_at = Some(result.finished_at);
        config.save(config_path)?;
    }
    Ok(result)
}

/// Sync after a local change when the config asks for it; never fails the command
fn auto_sync(store: &Arc<Store>, mut config: Config) {
    if !config.sync.auto_sync_due(Utc::now()) {
        return;
    }
    let direction = config.sync.direction;
    let config_path = store.config_path();
    match run_sync(Arc::clone(store), &mut config, &config_path, direction) {
        Ok(result) => tracing::info!(summary = %result, "Auto-sync finished"),
        Err(e) => tracing::warn!(error = %e, "Auto-sync failed"),
    }
}

pub fn sync(direction: Option<String>, dry_run: bool, json: bool) -> Result<()> {
    let (store, mut config) = open()?;
    let direction: SyncDirection = match direction {
        Some(d) => d.parse()?,
        None => config.sync.direction,
    };

    if dry_run {
        return preview_push(&store, direction, json);
    }

    let config_path = store.config_path();
    let result = run_sync(Arc::clone(&store), &mut config, &config_path, direction)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.is_noop() && !result.cancelled {
        println!("{} Already in sync", "✓".green());
    } else {
        let mark = if result.errors.is_empty() {
            "✓".green()
        } else {
            "!".yellow()
        };
        println!("{mark} {result}");
        for error in &result.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !result.success {
        bail!("Sync failed");
    }
    if !result.errors.is_empty() {
        bail!("{} issue(s) failed to sync", result.errors.len());
    }
    Ok(())
}

fn preview_push(store: &Store, direction: SyncDirection, json: bool) -> Result<()> {
    if direction == SyncDirection::Pull {
        bail!("--dry-run previews pushes; it cannot preview a pull without fetching");
    }
    let pending = store.list(&IssueFilter::all().needs_push());

    if json {
        println!("{}", serde_json::to_string(&pending)?);
    } else if pending.is_empty() {
        println!("Nothing to push");
    } else {
        for issue in &pending {
            let action = match issue.remote_id {
                Some(number) => format!("update #{number}").yellow(),
                None => "create".green(),
            };
            println!("{} {} - {}", format!("#{}", issue.local_id).cyan(), action, issue.title);
        }
    }
    Ok(())
}

/// Show current configuration
pub fn config_show(json: bool) -> Result<()> {
    let (_, config) = open()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("{}", "Current configuration:".bold());
        println!();
        println!("[sync]");
        match &config.sync.repository {
            Some(repo) => println!("repository = \"{}\"", repo),
            None => println!("# repository = (unset)"),
        }
        println!("direction = \"{}\"", config.sync.direction);
        println!("auto_sync = {}", config.sync.auto_sync);
        println!("interval_minutes = {}", config.sync.interval_minutes);
        if let Some(last) = config.sync.last_synced_at {
            println!("last_synced_at = \"{}\"", last.to_rfc3339());
        }
        println!();
        println!("[display]");
        println!("colors = {}", config.display.colors);
        println!("date_format = \"{}\"", config.display.date_format);
    }

    Ok(())
}

fn lookup<'a>(config: &'a serde_json::Value, key: &str) -> Result<&'a serde_json::Value> {
    key.split('.').try_fold(config, |value, part| {
        value
            .get(part)
            .ok_or_else(|| anyhow::anyhow!("Config key not found: {}", key))
    })
}

/// Get a specific config value
pub fn config_get(key: &str, json: bool) -> Result<()> {
    let (_, config) = open()?;
    let config_json = serde_json::to_value(&config)?;
    let value = lookup(&config_json, key)?;

    if json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        match value {
            serde_json::Value::String(s) => println!("{}", s),
            serde_json::Value::Bool(b) => println!("{}", b),
            serde_json::Value::Number(n) => println!("{}", n),
            serde_json::Value::Null => println!("null"),
            _ => println!("{}", serde_json::to_string_pretty(value)?),
        }
    }

    Ok(())
}

fn apply_setting(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let parse_bool = |v: &str| {
        v.parse::<bool>()
            .map_err(|_| anyhow::anyhow!("Invalid boolean value: {}", v))
    };

    match key {
        "sync.repository" => {
            config.sync.repository = if value.is_empty() {
                None
            } else {
                Some(value.parse()?)
            };
        }
        "sync.direction" => config.sync.direction = value.parse()?,
        "sync.auto_sync" => config.sync.auto_sync = parse_bool(value)?,
        "sync.interval_minutes" => {
            config.sync.interval_minutes = value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid integer value: {}", value))?;
        }
        "display.colors" => config.display.colors = parse_bool(value)?,
        "display.date_format" => config.display.date_format = value.to_string(),
        _ => bail!("Unknown config key: {}", key),
    }
    Ok(())
}

/// Set a config value
pub fn config_set(key: &str, value: &str) -> Result<()> {
    let (store, mut config) = open()?;
    apply_setting(&mut config, key, value)?;
    config.save(&store.config_path())?;
    println!("{} Set {} = {}", "✓".green(), key, value);
    Ok(())
}
