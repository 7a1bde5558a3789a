//! Startup check that the database schema is at the latest migration script.
//!
//! Scripts are `*.sql` files in the migrations directory carrying two header
//! comments:
//!
//! ```sql
//! -- revision: 2b1f
//! -- down_revision: 9a0c
//! ```
//!
//! The head is the one revision no other script points back to. The database
//! records its applied revision in a single-row version table.

use crate::config::{Configurator, Settings};
use crate::engine::{Connection, Engine};
use crate::error::{AppError, MigrationError};
use crate::registry::quote;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationConfig {
    pub script_location: PathBuf,
    pub version_table: String,
    pub url: Option<String>,
}

impl MigrationConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        MigrationConfig {
            script_location: settings.migrations_dir.clone(),
            version_table: settings.version_table.clone(),
            url: settings.database_url.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    pub revision: String,
    pub down_revision: Option<String>,
    pub path: PathBuf,
}

fn header<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix("--")?.trim_start();
    let value = rest.strip_prefix(key)?.trim_start().strip_prefix(':')?;
    Some(value.trim())
}

impl Script {
    pub fn parse(path: &Path, content: &str) -> Result<Script, MigrationError> {
        let mut revision = None;
        let mut down_revision = None;
        for line in content.lines() {
            if let Some(v) = header(line, "revision") {
                revision.get_or_insert_with(|| v.to_string());
            } else if let Some(v) = header(line, "down_revision") {
                down_revision.get_or_insert_with(|| v.to_string());
            }
        }
        let revision = revision
            .filter(|r| !r.is_empty())
            .ok_or_else(|| MigrationError::InvalidScript {
                path: path.to_path_buf(),
                reason: "missing '-- revision:' header".into(),
            })?;
        let down_revision = down_revision.filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("none"));
        Ok(Script {
            revision,
            down_revision,
            path: path.to_path_buf(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ScriptDirectory {
    location: PathBuf,
    scripts: Vec<Script>,
}

impl ScriptDirectory {
    /// Read every `*.sql` file directly under `location`.
    pub fn scan(location: &Path) -> Result<Self, MigrationError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(location)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
            .collect();
        paths.sort();
        let mut scripts = Vec::with_capacity(paths.len());
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let script = Script::parse(&path, &content)?;
            if let Some(first) = seen.insert(script.revision.clone(), path.clone()) {
                return Err(MigrationError::InvalidScript {
                    path,
                    reason: format!("revision '{}' already defined in {}", script.revision, first.display()),
                });
            }
            scripts.push(script);
        }
        Ok(ScriptDirectory {
            location: location.to_path_buf(),
            scripts,
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    /// Latest revision on disk; `None` for an empty directory.
    pub fn head(&self) -> Result<Option<String>, MigrationError> {
        let revisions: BTreeSet<&str> = self.scripts.iter().map(|s| s.revision.as_str()).collect();
        let mut referenced = BTreeSet::new();
        for script in &self.scripts {
            if let Some(down) = &script.down_revision {
                if !revisions.contains(down.as_str()) {
                    return Err(MigrationError::MissingDownRevision {
                        revision: script.revision.clone(),
                        down_revision: down.clone(),
                    });
                }
                referenced.insert(down.as_str());
            }
        }
        let cyclic = self.cyclic_revisions();
        if !cyclic.is_empty() {
            return Err(MigrationError::CyclicHistory(cyclic));
        }
        let heads: Vec<String> = revisions
            .difference(&referenced)
            .map(|r| r.to_string())
            .collect();
        match heads.len() {
            0 if self.scripts.is_empty() => Ok(None),
            1 => Ok(heads.into_iter().next()),
            _ => Err(MigrationError::MultipleHeads(heads)),
        }
    }

    /// Revisions whose down-revision chain leads back to themselves.
    fn cyclic_revisions(&self) -> Vec<String> {
        let down: HashMap<&str, &str> = self
            .scripts
            .iter()
            .filter_map(|s| s.down_revision.as_deref().map(|d| (s.revision.as_str(), d)))
            .collect();
        let mut cyclic: Vec<String> = self
            .scripts
            .iter()
            .map(|s| s.revision.as_str())
            .filter(|start| {
                let mut next = down.get(start);
                for _ in 0..self.scripts.len() {
                    match next {
                        Some(rev) if rev == start => return true,
                        Some(rev) => next = down.get(rev),
                        None => return false,
                    }
                }
                false
            })
            .map(String::from)
            .collect();
        cyclic.sort();
        cyclic
    }
}

/// Source of the two revisions the freshness check compares.
#[async_trait]
pub trait MigrationHistory: Send + Sync {
    async fn head_revision(&self, config: &MigrationConfig) -> Result<Option<String>, MigrationError>;

    async fn current_revision<C: Connection>(
        &self,
        conn: &mut C,
        config: &MigrationConfig,
    ) -> Result<Option<String>, MigrationError>;
}

/// Reads the script directory and the version table.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptHistory;

/// `schema.table` quoted part by part.
fn qualified(table: &str) -> String {
    table.split('.').map(quote).collect::<Vec<_>>().join(".")
}

pub(crate) fn version_table_exists_sql(table: &str) -> String {
    format!("SELECT to_regclass('{}')::text", qualified(table).replace('\'', "''"))
}

pub(crate) fn current_version_sql(table: &str) -> String {
    format!("SELECT version_num FROM {} LIMIT 1", qualified(table))
}

#[async_trait]
impl MigrationHistory for ScriptHistory {
    async fn head_revision(&self, config: &MigrationConfig) -> Result<Option<String>, MigrationError> {
        ScriptDirectory::scan(&config.script_location)?.head()
    }

    async fn current_revision<C: Connection>(
        &self,
        conn: &mut C,
        config: &MigrationConfig,
    ) -> Result<Option<String>, MigrationError> {
        let exists = conn
            .fetch_scalar(&version_table_exists_sql(&config.version_table))
            .await?;
        if exists.is_none() {
            return Ok(None);
        }
        Ok(conn.fetch_scalar(&current_version_sql(&config.version_table)).await?)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationCheck {
    /// `SKIP_CHECK_DB_MIGRATED` is set.
    Skipped,
    /// The process is itself a migration tool run.
    SkippedMigrationTool,
    UpToDate(Option<String>),
}

/// Compare the head script revision with the revision applied to the
/// database. Returns [`MigrationError::Outdated`] when they differ.
pub async fn check_db_migrated<E, H>(config: &Configurator<E>, history: &H) -> Result<MigrationCheck, MigrationError>
where
    E: Engine,
    H: MigrationHistory,
{
    if config.settings().skip_check_db_migrated {
        tracing::info!("migration check skipped by SKIP_CHECK_DB_MIGRATED");
        return Ok(MigrationCheck::Skipped);
    }
    if config.migration_tool_active() {
        tracing::info!("migration check skipped inside migration tool");
        return Ok(MigrationCheck::SkippedMigrationTool);
    }
    let migration = config.migration_config();
    let head = history.head_revision(&migration).await?;
    let engine = config.engine().map_err(AppError::from)?;
    let mut conn = engine.acquire().await?;
    let current = history.current_revision(&mut conn, &migration).await;
    conn.release(current.is_err());
    let current = current?;
    if head != current {
        tracing::error!(head = ?head, current = ?current, "database is not migrated to head");
        return Err(MigrationError::Outdated { head, current });
    }
    tracing::info!(revision = ?current, "database migrated to head");
    Ok(MigrationCheck::UpToDate(current))
}

/// [`check_db_migrated`], terminating the process with the diagnostic when
/// the database is behind (or ahead of) the scripts on disk.
pub async fn ensure_db_migrated<E, H>(config: &Configurator<E>, history: &H) -> Result<MigrationCheck, MigrationError>
where
    E: Engine,
    H: MigrationHistory,
{
    match check_db_migrated(config, history).await {
        Err(e @ MigrationError::Outdated { .. }) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
        other => other,
    }
}
