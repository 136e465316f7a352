//! Prompt log - in-process analytics and memory gateway
//!
//! Keeps every logged prompt in memory and, when opened on a path, appends
//! each entry to a JSONL file so the log survives restarts. Serves both
//! the aggregated usage view and the recent-prompts view.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{AnalyticsGateway, GatewayResult, MemoryGateway, RecentQuery, UsageQuery};
use crate::types::{PromptUsage, RecentPrompt};

/// Window in which an identical prompt counts as a duplicate
const DUPLICATE_WINDOW_SECS: i64 = 60;

/// One logged prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptLogEntry {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub completion: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    pub created_at: DateTime<Utc>,
}

fn default_source() -> String {
    "api".to_string()
}

impl PromptLogEntry {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            completion: None,
            user_id: None,
            tag: None,
            source: default_source(),
            created_at: Utc::now(),
        }
    }

    pub fn with_completion(mut self, completion: impl Into<String>) -> Self {
        self.completion = Some(completion.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Running aggregate for one prompt group
struct UsageGroup {
    prompt: String,
    count: u64,
    last_seen: DateTime<Utc>,
    completion: Option<(DateTime<Utc>, String)>,
}

/// Prompt history backing the analytics and memory gateways
pub struct PromptLog {
    entries: Mutex<Vec<PromptLogEntry>>,
    path: Option<PathBuf>,
}

impl PromptLog {
    /// An in-memory log that is never persisted
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Open (or create) a JSONL-backed log
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = Vec::new();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PromptLogEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(source = "prompt_log", "Skipping malformed line {} in {}: {}", line_no + 1, path.display(), e),
                }
            }
            info!(source = "prompt_log", "Loaded {} prompts from {}", entries.len(), path.display());
        } else if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        Ok(Self {
            entries: Mutex::new(entries),
            path: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PromptLogEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a prompt.
    ///
    /// The prompt is trimmed; empty prompts are rejected. When
    /// `allow_duplicates` is false, a prompt identical to one logged within
    /// the last minute is skipped and `None` is returned.
    pub fn log_prompt(
        &self,
        prompt: &str,
        completion: Option<&str>,
        user_id: Option<i64>,
        tag: Option<&str>,
        source: &str,
        allow_duplicates: bool,
    ) -> Result<Option<PromptLogEntry>> {
        let cleaned = prompt.trim();
        if cleaned.is_empty() {
            anyhow::bail!("Refusing to log an empty prompt");
        }

        if !allow_duplicates {
            let cutoff = Utc::now() - Duration::seconds(DUPLICATE_WINDOW_SECS);
            let recent_duplicate = self
                .lock()
                .iter()
                .any(|e| e.prompt == cleaned && e.created_at >= cutoff);
            if recent_duplicate {
                info!(source = "prompt_log", "Skipping duplicate prompt");
                return Ok(None);
            }
        }

        let mut entry = PromptLogEntry::new(cleaned);
        entry.completion = completion.map(|c| c.to_string());
        entry.user_id = user_id;
        entry.tag = tag.map(|t| t.to_string());
        entry.source = source.to_string();

        self.insert(entry.clone())?;
        debug!(source = "prompt_log", "Logged prompt (user={:?}, tag={:?})", user_id, tag);
        Ok(Some(entry))
    }

    /// Store a prebuilt entry as-is
    pub fn insert(&self, entry: PromptLogEntry) -> Result<()> {
        if let Some(path) = &self.path {
            let line = serde_json::to_string(&entry).context("Failed to serialize prompt")?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            writeln!(file, "{}", line)
                .with_context(|| format!("Failed to append to {}", path.display()))?;
        }
        self.lock().push(entry);
        Ok(())
    }

    /// Snapshot of every entry in insertion order
    pub fn entries(&self) -> Vec<PromptLogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn usage(&self, query: &UsageQuery, now: DateTime<Utc>) -> Vec<PromptUsage> {
        let cutoff = query.since_days.map(|days| now - Duration::days(days as i64));
        let entries = self.lock();

        let mut groups: HashMap<String, UsageGroup> = HashMap::new();
        for entry in entries.iter() {
            if query.tag.is_some() && entry.tag != query.tag {
                continue;
            }
            if query.user_id.is_some() && entry.user_id != query.user_id {
                continue;
            }
            if cutoff.map(|c| entry.created_at < c).unwrap_or(false) {
                continue;
            }

            let key = if query.case_insensitive {
                entry.prompt.to_lowercase()
            } else {
                entry.prompt.clone()
            };
            let group = groups.entry(key.clone()).or_insert_with(|| UsageGroup {
                prompt: key,
                count: 0,
                last_seen: entry.created_at,
                completion: None,
            });
            group.count += 1;
            group.last_seen = group.last_seen.max(entry.created_at);

            if let Some(completion) = entry.completion.as_deref().filter(|c| !c.trim().is_empty()) {
                let newer = group
                    .completion
                    .as_ref()
                    .map(|(seen, _)| entry.created_at >= *seen)
                    .unwrap_or(true);
                if newer {
                    group.completion = Some((entry.created_at, completion.to_string()));
                }
            }
        }

        let mut ranked: Vec<UsageGroup> = groups.into_values().collect();
        ranked.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a.prompt.cmp(&b.prompt))
        });

        // Length filter runs after the limit, so short prompts still use up slots
        ranked
            .into_iter()
            .take(query.limit)
            .filter(|g| g.prompt.trim().chars().count() >= query.min_length)
            .map(|g| PromptUsage {
                prompt: g.prompt,
                count: g.count,
                completion: g.completion.map(|(_, c)| c),
            })
            .collect()
    }

    fn recent(&self, query: &RecentQuery, now: DateTime<Utc>) -> Vec<RecentPrompt> {
        let cutoff = query.since_minutes.map(|m| now - Duration::minutes(m as i64));
        let entries = self.lock();

        let mut matching: Vec<&PromptLogEntry> = entries
            .iter()
            .filter(|e| query.tag.is_none() || e.tag == query.tag)
            .filter(|e| query.user_id.is_none() || e.user_id == query.user_id)
            .filter(|e| cutoff.map(|c| e.created_at >= c).unwrap_or(true))
            .collect();
        // Stable sort keeps later insertions first among equal timestamps
        matching.reverse();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        matching
            .into_iter()
            .take(query.limit)
            .map(|e| RecentPrompt {
                prompt: e.prompt.clone(),
                created_at: e.created_at,
            })
            .collect()
    }
}

#[async_trait]
impl AnalyticsGateway for PromptLog {
    async fn most_common_prompts(&self, query: &UsageQuery) -> GatewayResult<Vec<PromptUsage>> {
        Ok(self.usage(query, Utc::now()))
    }
}

#[async_trait]
impl MemoryGateway for PromptLog {
    async fn recent_prompts(&self, query: &RecentQuery) -> GatewayResult<Vec<RecentPrompt>> {
        Ok(self.recent(query, Utc::now()))
    }
}
