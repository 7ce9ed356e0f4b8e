//! Task orchestration: the crawl and create-accounts lifecycles.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use serde_json::json;
use uuid::Uuid;

use ojc_core::crawler::{Checkpoint, CrawlerCore, RunOutcome};

use crate::error::ClientError;
use crate::oj::Connector;
use crate::pool::prepare_pool;
use crate::store::{Store, TaskKind, TaskStatus};
use crate::submit::{POLL_INTERVAL, ProbeSubmitter};

/// Tunables of a task runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Working-pool size for a crawl task.
    pub accounts_per_crawl: usize,
    /// Password shared by all pool accounts.
    pub default_password: String,
    /// Prefix of generated account usernames.
    pub username_prefix: String,
    /// Domain of generated registration emails.
    pub email_domain: String,
    /// Submission poll cadence (tests shrink this).
    pub poll_interval: Duration,
}

impl RunnerConfig {
    pub const DEFAULT_ACCOUNTS_PER_CRAWL: usize = 3;
    /// Length of the random username suffix.
    pub const USERNAME_SUFFIX_LEN: usize = 28;
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            accounts_per_crawl: Self::DEFAULT_ACCOUNTS_PER_CRAWL,
            default_password: "orju-shared-pass-1".to_string(),
            username_prefix: "orju".to_string(),
            email_domain: "example.com".to_string(),
            poll_interval: POLL_INTERVAL,
        }
    }
}

/// Executes one task per invocation against a store and a judge connector.
pub struct TaskRunner {
    store: Arc<dyn Store>,
    connector: Arc<dyn Connector>,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn Store>, connector: Arc<dyn Connector>, config: RunnerConfig) -> Self {
        Self {
            store,
            connector,
            config,
        }
    }

    /// Run the task to a terminal or paused state. The returned error only
    /// reflects infrastructure failures (the store itself breaking); task
    /// failures are persisted on the task row.
    pub async fn run_task(&self, id: Uuid) -> anyhow::Result<()> {
        let task = self.store.task(id)?;
        match task.kind {
            TaskKind::Crawl {
                problem,
                template_set,
                header_code,
                footer_code,
                checkpoint,
            } => {
                self.run_crawl(id, problem, template_set, header_code, footer_code, checkpoint)
                    .await
            }
            TaskKind::CreateAccounts { quantity } => self.run_create_accounts(id, quantity).await,
        }
    }

    async fn run_crawl(
        &self,
        id: Uuid,
        problem: String,
        template_set: String,
        header_code: String,
        footer_code: String,
        checkpoint: Option<Checkpoint>,
    ) -> anyhow::Result<()> {
        self.store.set_task_status(id, TaskStatus::InProgress)?;
        self.store.set_task_progress(id, 5)?;
        tracing::info!(task = %id, problem = %problem, resuming = checkpoint.is_some(), "crawl task started");

        let (result, checkpoint_after) = self
            .crawl_body(id, &problem, &template_set, &header_code, &footer_code, checkpoint)
            .await;

        match result {
            Ok(RunOutcome::Completed) => {
                let count = self.store.testcases(&problem)?.len();
                self.store.set_task_checkpoint(id, None)?;
                self.store.set_task_progress(id, 100)?;
                self.store.set_task_result(
                    id,
                    Some(json!({
                        "message": format!("extracted {count} test cases for {problem}")
                    })),
                )?;
                self.store.set_task_status(id, TaskStatus::Success)?;
                tracing::info!(task = %id, testcases = count, "crawl task finished");
            }
            Ok(RunOutcome::Paused) => {
                self.store.set_task_checkpoint(id, checkpoint_after)?;
                self.store.set_task_status(id, TaskStatus::Paused)?;
                tracing::info!(task = %id, "crawl task paused");
            }
            Err(err) => {
                // Persist the checkpoint before the failure so the task can
                // be requeued from where it stopped.
                let last_state = checkpoint_after
                    .as_ref()
                    .and_then(|cp| serde_json::to_value(cp).ok());
                self.store.set_task_checkpoint(id, checkpoint_after)?;
                self.store.set_task_result(
                    id,
                    Some(json!({
                        "error": format!("{err:#}"),
                        "last_state": last_state,
                    })),
                )?;
                self.store.set_task_status(id, TaskStatus::Failure)?;
                tracing::error!(task = %id, error = %format!("{err:#}"), "crawl task failed");
            }
        }
        Ok(())
    }

    /// The fallible part of a crawl. Returns the run result together with
    /// the checkpoint to persist: the core's live state once a core exists,
    /// otherwise the checkpoint the task came in with.
    async fn crawl_body(
        &self,
        id: Uuid,
        problem_name: &str,
        template_set: &str,
        header_code: &str,
        footer_code: &str,
        checkpoint: Option<Checkpoint>,
    ) -> (anyhow::Result<RunOutcome>, Option<Checkpoint>) {
        let problem = match self.store.problem(problem_name) {
            Ok(problem) => problem,
            Err(err) => return (Err(err.into()), checkpoint),
        };
        let templates = match self.store.template_set(template_set) {
            Ok(templates) => templates,
            Err(err) => return (Err(err.into()), checkpoint),
        };
        if !problem.allowed_languages.contains(&templates.language) {
            return (
                Err(anyhow::anyhow!(
                    "language {:?} is not allowed for problem {}",
                    templates.language,
                    problem.display_id
                )),
                checkpoint,
            );
        }

        let pool = prepare_pool(
            &self.store,
            self.connector.as_ref(),
            self.config.accounts_per_crawl,
            &self.config.default_password,
        )
        .await;
        let (pool, lease) = match pool {
            Ok(v) => v,
            Err(err) => return (Err(err), checkpoint),
        };
        if let Err(err) = self.store.set_task_progress(id, 10) {
            return (Err(err.into()), checkpoint);
        }

        let submitter = ProbeSubmitter::new(
            self.store.clone(),
            pool,
            templates,
            &problem,
            header_code.to_string(),
            footer_code.to_string(),
        )
        .with_poll_interval(self.config.poll_interval);

        let pause_store = self.store.clone();
        let should_pause = move || {
            matches!(
                pause_store.task(id).map(|task| task.status),
                Ok(TaskStatus::Paused)
            )
        };

        let mut core = CrawlerCore::new(submitter, should_pause);
        if let Some(saved) = &checkpoint {
            if let Err(err) = core.load_checkpoint(saved) {
                return (Err(err.into()), checkpoint);
            }
        }

        let result = core.run().await;
        let saved = core.save_checkpoint();
        drop(lease);
        (result, Some(saved))
    }

    async fn run_create_accounts(&self, id: Uuid, quantity: u32) -> anyhow::Result<()> {
        self.store.set_task_status(id, TaskStatus::InProgress)?;
        tracing::info!(task = %id, quantity, "create-accounts task started");

        match self.create_accounts_body(id, quantity).await {
            Ok(()) => {
                self.store.set_task_progress(id, 100)?;
                self.store.set_task_result(
                    id,
                    Some(json!({
                        "message": format!("successfully created {quantity} accounts")
                    })),
                )?;
                self.store.set_task_status(id, TaskStatus::Success)?;
                Ok(())
            }
            Err(err) => {
                self.store
                    .set_task_result(id, Some(json!({ "error": format!("{err:#}") })))?;
                self.store.set_task_status(id, TaskStatus::Failure)?;
                tracing::error!(task = %id, error = %format!("{err:#}"), "create-accounts task failed");
                Ok(())
            }
        }
    }

    async fn create_accounts_body(&self, id: Uuid, quantity: u32) -> anyhow::Result<()> {
        if quantity == 0 {
            anyhow::bail!("quantity must be positive");
        }
        let max_failures = quantity * 2;
        let mut successes = 0_u32;
        let mut failures = 0_u32;

        while successes < quantity {
            if failures > max_failures {
                anyhow::bail!("exceeded maximum failure limit ({max_failures}), aborting task");
            }

            let username = random_username(
                &self.config.username_prefix,
                RunnerConfig::USERNAME_SUFFIX_LEN,
            );
            let email = format!("{username}@{}", self.config.email_domain);
            let client = self.connector.client()?;
            match client
                .register(&username, &self.config.default_password, &email)
                .await
            {
                Ok(()) => {
                    self.store.insert_account(&username)?;
                    successes += 1;
                    self.store
                        .set_task_progress(id, (successes * 100 / quantity) as u8)?;
                    tracing::info!(account = %username, "registered account");
                }
                Err(ClientError::AccountExists(_)) => {
                    failures += 1;
                    tracing::info!(account = %username, "username taken, trying another");
                }
                Err(ClientError::Captcha(_)) => {
                    failures += 1;
                    tracing::warn!("captcha rejected, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn random_username(prefix: &str, suffix_len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..suffix_len)
        .map(|_| char::from(CHARSET[rng.gen_range(0..CHARSET.len())]))
        .collect();
    format!("{prefix}{suffix}")
}
