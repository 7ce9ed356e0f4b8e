//! The real [`Submitter`]: renders a probe template, submits it through the
//! next pool account, polls the submission until judged, and returns the
//! judge-reported memory footprint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use ojc_core::crawler::Submitter;
use ojc_core::template::TemplateSet;

use crate::error::ClientError;
use crate::pool::ReadyAccount;
use crate::retry::with_retries;
use crate::store::{Problem, Store};

/// Cadence of the submission result poll.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Attempts per probe; each attempt rotates to the next pool account.
pub const MAX_PROBE_ATTEMPTS: u32 = 3;

pub struct ProbeSubmitter {
    store: Arc<dyn Store>,
    pool: Vec<ReadyAccount>,
    templates: TemplateSet,
    problem_display_id: String,
    problem_submit_id: i64,
    header_code: String,
    footer_code: String,
    poll_interval: Duration,
    next_account: usize,
}

impl ProbeSubmitter {
    /// `pool` must be non-empty; `prepare_pool` guarantees that.
    pub fn new(
        store: Arc<dyn Store>,
        pool: Vec<ReadyAccount>,
        templates: TemplateSet,
        problem: &Problem,
        header_code: String,
        footer_code: String,
    ) -> Self {
        Self {
            store,
            pool,
            templates,
            problem_display_id: problem.display_id.clone(),
            problem_submit_id: problem.submit_id,
            header_code,
            footer_code,
            poll_interval: POLL_INTERVAL,
            next_account: 0,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn wrap(&self, body: &str) -> String {
        format!("{}\n{body}\n{}", self.header_code, self.footer_code)
    }

    async fn submit_and_measure(&mut self, body: String) -> Result<f64, ClientError> {
        let rendered = self.wrap(&body);
        let code = rendered.as_str();
        let pool: &[ReadyAccount] = &self.pool;
        let store = &self.store;
        let language = self.templates.language.as_str();
        let problem_id = self.problem_submit_id;
        let poll_interval = self.poll_interval;
        let base = self.next_account;

        let result = with_retries(MAX_PROBE_ATTEMPTS, move |attempt| {
            let accounts = pool;
            let entry = &accounts[(base + attempt as usize - 1) % accounts.len()];
            async move { probe_once(store, entry, code, language, problem_id, poll_interval).await }
        })
        .await;

        self.next_account = (base + 1) % self.pool.len();
        result
    }
}

async fn probe_once(
    store: &Arc<dyn Store>,
    entry: &ReadyAccount,
    code: &str,
    language: &str,
    problem_id: i64,
    poll_interval: Duration,
) -> Result<f64, ClientError> {
    let submission_id = entry.client.submit_code(code, language, problem_id).await?;
    if let Err(err) = store.touch_account(&entry.account.username) {
        tracing::warn!(account = %entry.account.username, error = %err, "failed to stamp last_used");
    }

    loop {
        tokio::time::sleep(poll_interval).await;
        let record = entry.client.get_submission(&submission_id).await?;
        if !record.verdict.is_judged() {
            continue;
        }
        return record.memory_cost.ok_or_else(|| {
            ClientError::Protocol("submission judged but memory usage is missing".to_string())
        });
    }
}

#[async_trait]
impl Submitter for ProbeSubmitter {
    async fn found_testcase(&mut self, testcase: &[u8]) -> anyhow::Result<()> {
        let inserted = self.store.record_testcase(&self.problem_display_id, testcase)?;
        if inserted {
            tracing::info!(
                problem = %self.problem_display_id,
                bytes = testcase.len(),
                "recorded test case"
            );
        }
        Ok(())
    }

    async fn get_next_char(&mut self, prefix: &[u8], limit: u32) -> anyhow::Result<f64> {
        let body = self.templates.render_next_char(prefix, limit);
        Ok(self.submit_and_measure(body).await?)
    }

    async fn get_prefix_length_length(&mut self, prefix: &[u8]) -> anyhow::Result<f64> {
        let body = self.templates.render_prefix_length_length(prefix);
        Ok(self.submit_and_measure(body).await?)
    }

    async fn get_prefix_length(
        &mut self,
        prefix: &[u8],
        length_prefix: u64,
        position: u32,
    ) -> anyhow::Result<f64> {
        let body = self
            .templates
            .render_prefix_length(prefix, length_prefix, position);
        Ok(self.submit_and_measure(body).await?)
    }

    async fn get_number(&mut self, number: i64) -> anyhow::Result<f64> {
        let body = self.templates.render_number(number);
        Ok(self.submit_and_measure(body).await?)
    }
}
