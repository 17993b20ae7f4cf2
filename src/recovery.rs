//! Diagnosis and enhancement of tasks that exited without completing.
//!
//! The recent log text is scored against five weighted regex families to
//! guess *why* the agent stopped. The winning reason picks an enhancement
//! for the retry (more context, a test scaffold, a split, or constraints)
//! and a retry strategy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::actions::is_contained;
use crate::error::{HealerError, Result};

/// Maximum number of related files attached to an enhancement.
const MAX_FILES: usize = 10;

/// Log lines kept as evidence.
const EVIDENCE_LINES: usize = 20;

// ============================================================================
// Task backend boundary
// ============================================================================

/// Task metadata supplied by the loop's task store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Existing PRD markdown, if any.
    #[serde(default)]
    pub prd: Option<String>,
    /// Directory (relative to the project) the task works in.
    #[serde(default)]
    pub feature_area: Option<String>,
}

/// Payload for a new sub-task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskData {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Capability the task loop provides to recovery.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Look up a task. `Ok(None)` if it does not exist.
    async fn get_task(&self, id: &str) -> anyhow::Result<Option<TaskInfo>>;

    /// Create a child task and return its id.
    async fn create_sub_task(&self, parent_id: &str, data: SubTaskData) -> anyhow::Result<String>;
}

// ============================================================================
// Analysis types
// ============================================================================

/// Why a task stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    VaguePrd,
    MissingTests,
    MissingContext,
    ScopeLarge,
    WrongApproach,
}

impl ExitReason {
    pub const ALL: [ExitReason; 5] = [
        Self::VaguePrd,
        Self::MissingTests,
        Self::MissingContext,
        Self::ScopeLarge,
        Self::WrongApproach,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VaguePrd => "vague_prd",
            Self::MissingTests => "missing_tests",
            Self::MissingContext => "missing_context",
            Self::ScopeLarge => "scope_large",
            Self::WrongApproach => "wrong_approach",
        }
    }

    /// Retry strategy for this reason.
    pub fn strategy(&self) -> RecoveryStrategy {
        match self {
            Self::WrongApproach => RecoveryStrategy::ModelFallback,
            Self::ScopeLarge => RecoveryStrategy::TaskRestart,
            _ => RecoveryStrategy::ContextTruncation,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the loop should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    ContextTruncation,
    ModelFallback,
    TaskRestart,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContextTruncation => "context-truncation",
            Self::ModelFallback => "model-fallback",
            Self::TaskRestart => "task-restart",
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to add to the task before retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Enhancement {
    #[serde(rename_all = "camelCase")]
    ClarifyPrd {
        key_files: Vec<String>,
        context: String,
        hints: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    TestScaffold { scaffold: String, hints: Vec<String> },
    #[serde(rename_all = "camelCase")]
    AttachContext { files: Vec<String>, context: String },
    #[serde(rename_all = "camelCase")]
    SplitTask { split_into: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Constrain {
        non_goals: Vec<String>,
        hints: Vec<String>,
    },
}

/// Diagnosis of one early exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAnalysis {
    pub task_id: String,
    pub exit_reason: ExitReason,
    pub scores: BTreeMap<ExitReason, u32>,
    pub evidence: Vec<String>,
    pub enhancement: Enhancement,
    pub strategy: RecoveryStrategy,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryAnalysis {
    /// Key used for per-session deduplication.
    pub fn history_key(&self) -> String {
        history_key(&self.task_id, self.exit_reason)
    }
}

/// `"taskId:exitReason"`.
pub fn history_key(task_id: &str, reason: ExitReason) -> String {
    format!("{}:{}", task_id, reason.as_str())
}

// ============================================================================
// Scoring
// ============================================================================

/// (reason, weight, patterns), evaluated case-insensitively.
const FAMILIES: &[(ExitReason, u32, &[&str])] = &[
    (
        ExitReason::VaguePrd,
        2,
        &[
            r"need(?:s)? more (?:detail|details|information)",
            r"can you clarify",
            r"which file",
            r"unclear (?:what|which|requirements?)",
            r"\bambiguous\b",
            r"not sure what (?:you want|is expected)",
        ],
    ),
    (
        ExitReason::MissingTests,
        2,
        &[
            r"no tests? (?:found|exist)",
            r"missing tests?",
            r"\b0 tests\b",
            r"test file (?:does not exist|not found)",
            r"without (?:any )?tests",
        ],
    ),
    (
        ExitReason::MissingContext,
        2,
        &[
            r"could not (?:find|locate) (?:the )?(?:module|function|definition|type|implementation)",
            r"(?:don't|do not) have (?:enough )?context",
            r"unknown (?:module|symbol|import)",
            r"where is (?:the )?\w+ defined",
        ],
    ),
    (
        ExitReason::ScopeLarge,
        3,
        &[
            r"too (?:complex|large|big)",
            r"too many files",
            r"should we split",
            r"break (?:this|it) (?:down|up)",
            r"exceeds? (?:the )?(?:context|token) (?:limit|window)",
        ],
    ),
    (
        ExitReason::WrongApproach,
        3,
        &[
            r"wrong approach",
            r"(?:doesn't|does not) work",
            r"\breverting\b",
            r"tried (?:several|multiple) approaches",
            r"going in circles",
        ],
    ),
];

/// Path-like substrings in free text.
const PATH_LIKE: &str =
    r"(?:[\w.-]+/)*[\w.-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|kt|rb|md|json|toml|ya?ml|sh)\b";

/// Scores recent logs and builds enhancements.
pub struct RecoveryAnalyzer {
    project_dir: PathBuf,
    families: Vec<(ExitReason, u32, Vec<Regex>)>,
    path_like: Option<Regex>,
}

impl std::fmt::Debug for RecoveryAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryAnalyzer")
            .field("project_dir", &self.project_dir)
            .finish()
    }
}

impl RecoveryAnalyzer {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let families = FAMILIES
            .iter()
            .map(|(reason, weight, patterns)| {
                let regexes = patterns
                    .iter()
                    .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
                    .collect();
                (*reason, *weight, regexes)
            })
            .collect();

        Self {
            project_dir: project_dir.into(),
            families,
            path_like: Regex::new(PATH_LIKE).ok(),
        }
    }

    /// Weighted match counts per reason.
    pub fn score(&self, text: &str) -> BTreeMap<ExitReason, u32> {
        self.families
            .iter()
            .map(|(reason, weight, regexes)| {
                let hits: usize = regexes.iter().map(|re| re.find_iter(text).count()).sum();
                (*reason, hits as u32 * weight)
            })
            .collect()
    }

    /// Highest-scoring reason; `VaguePrd` when nothing matched. Earlier
    /// families win ties.
    pub fn classify(&self, text: &str) -> (ExitReason, BTreeMap<ExitReason, u32>) {
        let scores = self.score(text);
        let mut best = ExitReason::VaguePrd;
        let mut best_score = 0;
        for reason in ExitReason::ALL {
            let score = scores.get(&reason).copied().unwrap_or(0);
            if score > best_score {
                best = reason;
                best_score = score;
            }
        }
        (best, scores)
    }

    /// Diagnose an early exit and build the retry enhancement.
    pub async fn analyze_early_exit(
        &self,
        task_id: &str,
        recent_lines: &[String],
        backend: &dyn TaskBackend,
    ) -> RecoveryAnalysis {
        let text = recent_lines.join("\n");
        let (reason, scores) = self.classify(&text);
        debug!("[healer] Early exit of {} scored {:?}", task_id, scores);

        let task = match backend.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!("[healer] Task {} not found in backend", task_id);
                TaskInfo {
                    id: task_id.to_string(),
                    title: task_id.to_string(),
                    ..TaskInfo::default()
                }
            }
            Err(e) => {
                warn!("[healer] Could not load task {}: {}", task_id, e);
                TaskInfo {
                    id: task_id.to_string(),
                    title: task_id.to_string(),
                    ..TaskInfo::default()
                }
            }
        };

        let files = self.locate_files(&task);
        let enhancement = self.build_enhancement(reason, &task, &files);
        let start = recent_lines.len().saturating_sub(EVIDENCE_LINES);

        info!(
            "[healer] Task {} exited early: {} -> {:?}",
            task_id,
            reason,
            reason.strategy()
        );

        RecoveryAnalysis {
            task_id: task_id.to_string(),
            exit_reason: reason,
            scores,
            evidence: recent_lines[start..].to_vec(),
            enhancement,
            strategy: reason.strategy(),
            timestamp: Utc::now(),
        }
    }

    /// Carry out the parts of an analysis that touch the backend. Creates
    /// the proposed sub-tasks for a split and returns their ids.
    ///
    /// # Errors
    ///
    /// Returns [`HealerError::TaskBackend`] if sub-task creation fails.
    pub async fn apply(
        &self,
        analysis: &RecoveryAnalysis,
        backend: &dyn TaskBackend,
    ) -> Result<Vec<String>> {
        let Enhancement::SplitTask { split_into } = &analysis.enhancement else {
            return Ok(Vec::new());
        };

        let mut created = Vec::with_capacity(split_into.len());
        for (index, title) in split_into.iter().enumerate() {
            let mut metadata = BTreeMap::new();
            metadata.insert("parentId".to_string(), analysis.task_id.clone());
            metadata.insert("order".to_string(), (index + 1).to_string());
            metadata.insert("exitReason".to_string(), analysis.exit_reason.to_string());

            let data = SubTaskData {
                title: title.clone(),
                description: format!(
                    "Split from {} after an early exit ({})",
                    analysis.task_id, analysis.exit_reason
                ),
                metadata,
            };
            let id = backend
                .create_sub_task(&analysis.task_id, data)
                .await
                .map_err(|e| HealerError::task_backend(e.to_string()))?;
            created.push(id);
        }
        info!(
            "[healer] Split {} into {} sub-tasks",
            analysis.task_id,
            created.len()
        );
        Ok(created)
    }

    /// Existing files mentioned in the task text, then files under the
    /// feature area, capped at [`MAX_FILES`].
    fn locate_files(&self, task: &TaskInfo) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();

        if let Some(re) = &self.path_like {
            let text = format!("{}\n{}", task.title, task.description);
            for m in re.find_iter(&text) {
                let candidate = m.as_str().trim_start_matches("./");
                if !is_contained(Path::new(candidate)) {
                    debug!("[healer] Ignoring path outside the project: {}", candidate);
                    continue;
                }
                if self.project_dir.join(candidate).is_file() && !files.iter().any(|f| f == candidate) {
                    files.push(candidate.to_string());
                    if files.len() >= MAX_FILES {
                        return files;
                    }
                }
            }
        }

        if let Some(area) = task
            .feature_area
            .as_deref()
            .filter(|a| !a.is_empty() && is_contained(Path::new(a)))
        {
            let root = self.project_dir.join(area);
            let walker = WalkDir::new(&root)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_ignored_dir(e.path()));
            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&self.project_dir) else {
                    continue;
                };
                let rel = rel.to_string_lossy().replace('\\', "/");
                if !files.contains(&rel) {
                    files.push(rel);
                }
                if files.len() >= MAX_FILES {
                    break;
                }
            }
        }

        files
    }

    fn build_enhancement(&self, reason: ExitReason, task: &TaskInfo, files: &[String]) -> Enhancement {
        match reason {
            ExitReason::VaguePrd => Enhancement::ClarifyPrd {
                key_files: files.to_vec(),
                context: if task.description.is_empty() {
                    format!("Task '{}'", task.title)
                } else {
                    format!("Task '{}': {}", task.title, task.description)
                },
                hints: vec![
                    "Read the key files before changing anything".to_string(),
                    "State assumptions explicitly and proceed with the simplest reading".to_string(),
                    "Do not stop to ask questions; record open points in the PRD".to_string(),
                ],
            },
            ExitReason::MissingTests => Enhancement::TestScaffold {
                scaffold: self.test_scaffold(task),
                hints: vec!["Write failing tests first, then implement until they pass".to_string()],
            },
            ExitReason::MissingContext => {
                let mut context = String::from("Relevant files:");
                for file in files {
                    context.push_str("\n- ");
                    context.push_str(file);
                }
                if files.is_empty() {
                    context.push_str("\n(none located; search the repository before editing)");
                }
                Enhancement::AttachContext {
                    files: files.to_vec(),
                    context,
                }
            }
            ExitReason::ScopeLarge => {
                let sections = task
                    .prd
                    .as_deref()
                    .map(|prd| prd.lines().filter(|l| l.starts_with("## ")).count())
                    .unwrap_or(0);
                let parts: &[&str] = if sections >= 3 {
                    &["foundation", "core implementation", "integration and tests"]
                } else {
                    &["core implementation", "tests and integration"]
                };
                Enhancement::SplitTask {
                    split_into: parts
                        .iter()
                        .map(|part| format!("{}: {}", task.title, part))
                        .collect(),
                }
            }
            ExitReason::WrongApproach => {
                let mut hints = vec!["Review similar code in the repository before starting".to_string()];
                if let Some(first) = files.first() {
                    hints.push(format!("Start from {first}"));
                }
                Enhancement::Constrain {
                    non_goals: vec![
                        "Do not repeat the previous approach".to_string(),
                        "Do not rewrite unrelated modules".to_string(),
                        "Do not change public interfaces unless the task requires it".to_string(),
                    ],
                    hints,
                }
            }
        }
    }

    fn test_scaffold(&self, task: &TaskInfo) -> String {
        let slug: String = task
            .title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect::<String>()
            .split('_')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        let slug = if slug.is_empty() { "task".to_string() } else { slug };

        if self.project_dir.join("Cargo.toml").exists() {
            format!(
                "#[cfg(test)]\nmod tests {{\n    use super::*;\n\n    #[test]\n    fn test_{slug}() {{\n        // Arrange\n        // Act\n        // Assert\n        unimplemented!(\"{}\");\n    }}\n}}\n",
                task.id
            )
        } else {
            format!(
                "describe('{}', () => {{\n  it('{slug}', () => {{\n    // Arrange\n    // Act\n    // Assert\n    throw new Error('not implemented: {}');\n  }});\n}});\n",
                task.title, task.id
            )
        }
    }
}

fn is_ignored_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| (n.starts_with('.') && n.len() > 1) || n == "target" || n == "node_modules")
}
