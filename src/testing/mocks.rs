//! Mock implementations of the task backend and remediation seams.

use crate::actions::{Action, Remediation};
use crate::recovery::{SubTaskData, TaskBackend, TaskInfo};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// In-memory task store.
///
/// Sub-task ids are `<parent>.<n>`, numbered from 1 per mock.
#[derive(Debug, Default)]
pub struct MockTaskBackend {
    tasks: HashMap<String, TaskInfo>,
    error: Option<String>,
    created: Mutex<Vec<(String, SubTaskData)>>,
}

impl MockTaskBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a task available to `get_task`.
    #[must_use]
    pub fn with_task(mut self, task: TaskInfo) -> Self {
        self.tasks.insert(task.id.clone(), task);
        self
    }

    /// Make every call fail with `error`.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Sub-tasks created so far, as (parent id, data).
    pub fn created_sub_tasks(&self) -> Vec<(String, SubTaskData)> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TaskBackend for MockTaskBackend {
    async fn get_task(&self, id: &str) -> Result<Option<TaskInfo>> {
        if let Some(error) = &self.error {
            bail!("{}", error);
        }
        Ok(self.tasks.get(id).cloned())
    }

    async fn create_sub_task(&self, parent_id: &str, data: SubTaskData) -> Result<String> {
        if let Some(error) = &self.error {
            bail!("{}", error);
        }
        let mut created = self
            .created
            .lock()
            .map_err(|_| anyhow::anyhow!("mock backend lock poisoned"))?;
        created.push((parent_id.to_string(), data));
        Ok(format!("{}.{}", parent_id, created.len()))
    }
}

/// Remediation with scripted outcomes.
#[derive(Debug)]
pub struct MockRemediation {
    name: String,
    error: Option<String>,
    fail_count: u32,
    call_count: AtomicU32,
}

impl MockRemediation {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            error: None,
            fail_count: 0,
            call_count: AtomicU32::new(0),
        }
    }

    /// Fail on every call.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Fail the first `count` calls, then succeed.
    #[must_use]
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = count;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remediation for MockRemediation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, action: &Action) -> Result<String> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = &self.error {
            bail!("{}", error);
        }
        if call <= self.fail_count {
            bail!("{} failed (attempt {})", self.name, call);
        }
        Ok(format!("{} applied for {}", self.name, action.pattern))
    }
}
