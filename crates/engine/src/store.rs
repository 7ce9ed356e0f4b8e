//! Persistent state: problems, probe template sets, accounts, extracted test
//! cases, and tasks.
//!
//! [`Store`] pins the contract the orchestrator needs from the backing
//! relational store; every method is one transaction. [`JsonStore`] is the
//! bundled implementation: a mutex-guarded state tree persisted as a
//! versioned JSON file with atomic tmp+rename writes. Holding the lock for
//! the whole mutation is what gives account leasing its select-for-update
//! semantics in-process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ojc_core::crawler::Checkpoint;
use ojc_core::template::TemplateSet;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("problem {0} not found")]
    ProblemNotFound(String),
    #[error("template set {0} not found")]
    TemplateSetNotFound(String),
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("account {0} already exists")]
    AccountExists(String),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("task {id} is {status:?}, expected one of {expected:?}")]
    InvalidTaskState {
        id: Uuid,
        status: TaskStatus,
        expected: &'static [TaskStatus],
    },
    #[error("task {0} is not a crawl task")]
    NotACrawlTask(Uuid),
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A judge problem, immutable during a crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// URL-friendly id, e.g. `PR113-2-12`.
    pub display_id: String,
    /// Integer wire key used when submitting.
    pub submit_id: i64,
    pub title: String,
    pub allowed_languages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    /// Free for leasing.
    Active,
    /// Leased by exactly one task.
    InUse,
    /// Permanently unusable; a sink state.
    Disabled,
}

/// A judge credential pair. The password is shared configuration, not a row
/// field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub status: AccountStatus,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Paused,
    Success,
    Failure,
}

/// Task-kind specific fields, tagged as `task_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskKind {
    Crawl {
        problem: String,
        template_set: String,
        #[serde(default)]
        header_code: String,
        #[serde(default)]
        footer_code: String,
        #[serde(default)]
        checkpoint: Option<Checkpoint>,
    },
    CreateAccounts {
        quantity: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestCaseRow {
    problem: String,
    #[serde(with = "ojc_core::bytes")]
    content: Vec<u8>,
    created_at: DateTime<Utc>,
}

/// Contract of the backing store. Every method is atomic.
pub trait Store: Send + Sync {
    fn upsert_problem(&self, problem: Problem) -> Result<(), StoreError>;
    fn problem(&self, display_id: &str) -> Result<Problem, StoreError>;
    fn upsert_template_set(&self, set: TemplateSet) -> Result<(), StoreError>;
    fn template_set(&self, name: &str) -> Result<TemplateSet, StoreError>;

    /// Insert a fresh ACTIVE account.
    fn insert_account(&self, username: &str) -> Result<Account, StoreError>;
    fn accounts(&self) -> Result<Vec<Account>, StoreError>;
    /// Flip up to `max` ACTIVE accounts to IN_USE and return them, all under
    /// one transaction.
    fn lease_accounts(&self, max: usize) -> Result<Vec<Account>, StoreError>;
    /// Flip the listed accounts back from IN_USE to ACTIVE. DISABLED is a
    /// sink; unknown or already-ACTIVE entries are left untouched.
    fn release_accounts(&self, usernames: &[String]) -> Result<(), StoreError>;
    fn disable_account(&self, username: &str) -> Result<(), StoreError>;
    /// Stamp `last_used` with the current time.
    fn touch_account(&self, username: &str) -> Result<(), StoreError>;

    /// Record an extracted test case. Idempotent on `(problem, content)`;
    /// returns whether a new row was inserted.
    fn record_testcase(&self, problem: &str, content: &[u8]) -> Result<bool, StoreError>;
    fn testcases(&self, problem: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    fn create_task(&self, kind: TaskKind) -> Result<Task, StoreError>;
    fn task(&self, id: Uuid) -> Result<Task, StoreError>;
    /// The PENDING or IN_PROGRESS crawl task for a problem, if one exists.
    /// Job submission reuses this instead of enqueuing a duplicate.
    fn find_active_crawl(&self, problem: &str) -> Result<Option<Task>, StoreError>;
    fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError>;
    fn set_task_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError>;
    fn set_task_result(&self, id: Uuid, result: Option<serde_json::Value>)
    -> Result<(), StoreError>;
    fn set_task_checkpoint(
        &self,
        id: Uuid,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), StoreError>;
    /// Mark a PENDING or IN_PROGRESS task as PAUSED; rejected otherwise.
    fn request_pause(&self, id: Uuid) -> Result<(), StoreError>;
    /// Reset a FAILURE or PAUSED task to PENDING, optionally replacing the
    /// stored checkpoint.
    fn requeue_task(&self, id: Uuid, checkpoint: Option<Checkpoint>) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    problems: BTreeMap<String, Problem>,
    #[serde(default)]
    template_sets: BTreeMap<String, TemplateSet>,
    #[serde(default)]
    accounts: BTreeMap<String, Account>,
    #[serde(default)]
    testcases: Vec<TestCaseRow>,
    #[serde(default)]
    tasks: BTreeMap<Uuid, Task>,
}

/// JSON-file store. `open` reads an existing file; `in_memory` keeps the
/// state process-local (used by tests).
pub struct JsonStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            StoreState {
                version: 1,
                ..StoreState::default()
            }
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState {
                version: 1,
                ..StoreState::default()
            }),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let state = self.state.lock().expect("store lock");
        f(&state)
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().expect("store lock");
        let out = f(&mut state)?;
        if let Some(path) = &self.path {
            persist_file(path, &state)?;
        }
        Ok(out)
    }
}

fn persist_file(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

fn with_task<T>(
    state: &mut StoreState,
    id: Uuid,
    f: impl FnOnce(&mut Task) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let task = state.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
    let out = f(task)?;
    task.updated_at = Utc::now();
    Ok(out)
}

impl Store for JsonStore {
    fn upsert_problem(&self, problem: Problem) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.problems.insert(problem.display_id.clone(), problem);
            Ok(())
        })
    }

    fn problem(&self, display_id: &str) -> Result<Problem, StoreError> {
        self.read(|state| {
            state
                .problems
                .get(display_id)
                .cloned()
                .ok_or_else(|| StoreError::ProblemNotFound(display_id.to_string()))
        })
    }

    fn upsert_template_set(&self, set: TemplateSet) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.template_sets.insert(set.name.clone(), set);
            Ok(())
        })
    }

    fn template_set(&self, name: &str) -> Result<TemplateSet, StoreError> {
        self.read(|state| {
            state
                .template_sets
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::TemplateSetNotFound(name.to_string()))
        })
    }

    fn insert_account(&self, username: &str) -> Result<Account, StoreError> {
        self.mutate(|state| {
            if state.accounts.contains_key(username) {
                return Err(StoreError::AccountExists(username.to_string()));
            }
            let account = Account {
                username: username.to_string(),
                status: AccountStatus::Active,
                last_used: None,
                created_at: Utc::now(),
            };
            state.accounts.insert(username.to_string(), account.clone());
            Ok(account)
        })
    }

    fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.read(|state| Ok(state.accounts.values().cloned().collect()))
    }

    fn lease_accounts(&self, max: usize) -> Result<Vec<Account>, StoreError> {
        self.mutate(|state| {
            let mut leased = Vec::new();
            for account in state.accounts.values_mut() {
                if leased.len() >= max {
                    break;
                }
                if account.status == AccountStatus::Active {
                    account.status = AccountStatus::InUse;
                    leased.push(account.clone());
                }
            }
            Ok(leased)
        })
    }

    fn release_accounts(&self, usernames: &[String]) -> Result<(), StoreError> {
        self.mutate(|state| {
            for username in usernames {
                if let Some(account) = state.accounts.get_mut(username) {
                    if account.status == AccountStatus::InUse {
                        account.status = AccountStatus::Active;
                    }
                }
            }
            Ok(())
        })
    }

    fn disable_account(&self, username: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            let account = state
                .accounts
                .get_mut(username)
                .ok_or_else(|| StoreError::AccountNotFound(username.to_string()))?;
            account.status = AccountStatus::Disabled;
            Ok(())
        })
    }

    fn touch_account(&self, username: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            let account = state
                .accounts
                .get_mut(username)
                .ok_or_else(|| StoreError::AccountNotFound(username.to_string()))?;
            account.last_used = Some(Utc::now());
            Ok(())
        })
    }

    fn record_testcase(&self, problem: &str, content: &[u8]) -> Result<bool, StoreError> {
        self.mutate(|state| {
            let exists = state
                .testcases
                .iter()
                .any(|row| row.problem == problem && row.content == content);
            if exists {
                return Ok(false);
            }
            state.testcases.push(TestCaseRow {
                problem: problem.to_string(),
                content: content.to_vec(),
                created_at: Utc::now(),
            });
            Ok(true)
        })
    }

    fn testcases(&self, problem: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.read(|state| {
            Ok(state
                .testcases
                .iter()
                .filter(|row| row.problem == problem)
                .map(|row| row.content.clone())
                .collect())
        })
    }

    fn create_task(&self, kind: TaskKind) -> Result<Task, StoreError> {
        self.mutate(|state| {
            let now = Utc::now();
            let task = Task {
                id: Uuid::new_v4(),
                status: TaskStatus::Pending,
                progress: 0,
                result: None,
                created_at: now,
                updated_at: now,
                kind,
            };
            state.tasks.insert(task.id, task.clone());
            Ok(task)
        })
    }

    fn task(&self, id: Uuid) -> Result<Task, StoreError> {
        self.read(|state| state.tasks.get(&id).cloned().ok_or(StoreError::TaskNotFound(id)))
    }

    fn find_active_crawl(&self, problem: &str) -> Result<Option<Task>, StoreError> {
        self.read(|state| {
            Ok(state
                .tasks
                .values()
                .find(|task| {
                    matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress)
                        && matches!(&task.kind, TaskKind::Crawl { problem: p, .. } if p == problem)
                })
                .cloned())
        })
    }

    fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        self.mutate(|state| {
            with_task(state, id, |task| {
                task.status = status;
                Ok(())
            })
        })
    }

    fn set_task_progress(&self, id: Uuid, progress: u8) -> Result<(), StoreError> {
        self.mutate(|state| {
            with_task(state, id, |task| {
                task.progress = progress.min(100);
                Ok(())
            })
        })
    }

    fn set_task_result(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            with_task(state, id, |task| {
                task.result = result;
                Ok(())
            })
        })
    }

    fn set_task_checkpoint(
        &self,
        id: Uuid,
        checkpoint: Option<Checkpoint>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            with_task(state, id, |task| match &mut task.kind {
                TaskKind::Crawl {
                    checkpoint: slot, ..
                } => {
                    *slot = checkpoint;
                    Ok(())
                }
                TaskKind::CreateAccounts { .. } => Err(StoreError::NotACrawlTask(id)),
            })
        })
    }

    fn request_pause(&self, id: Uuid) -> Result<(), StoreError> {
        self.mutate(|state| {
            with_task(state, id, |task| {
                if !matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
                    return Err(StoreError::InvalidTaskState {
                        id,
                        status: task.status,
                        expected: &[TaskStatus::Pending, TaskStatus::InProgress],
                    });
                }
                task.status = TaskStatus::Paused;
                Ok(())
            })
        })
    }

    fn requeue_task(&self, id: Uuid, checkpoint: Option<Checkpoint>) -> Result<(), StoreError> {
        self.mutate(|state| {
            with_task(state, id, |task| {
                if !matches!(task.status, TaskStatus::Failure | TaskStatus::Paused) {
                    return Err(StoreError::InvalidTaskState {
                        id,
                        status: task.status,
                        expected: &[TaskStatus::Failure, TaskStatus::Paused],
                    });
                }
                if let Some(replacement) = checkpoint {
                    match &mut task.kind {
                        TaskKind::Crawl {
                            checkpoint: slot, ..
                        } => *slot = Some(replacement),
                        TaskKind::CreateAccounts { .. } => {
                            return Err(StoreError::NotACrawlTask(id));
                        }
                    }
                }
                task.status = TaskStatus::Pending;
                task.progress = 0;
                task.result = None;
                Ok(())
            })
        })
    }
}
