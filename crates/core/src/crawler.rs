//! Resumable depth-first traversal of the hidden test-case space.
//!
//! The crawler drives a [`Submitter`] through probe queries, decodes the raw
//! memory readings through the fitted [`LinearModel`], and reconstructs every
//! test case byte by byte. Its complete execution state fits in a
//! [`Checkpoint`], so a paused or crashed run resumes exactly where it
//! stopped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Coefficients, LinearModel};

/// Answers the five side-channel probe queries.
///
/// The four `get_*` operations return the RAW memory reading of the probe
/// submission; the crawler owns the measurement model and performs the
/// decode. `found_testcase` records a completed test case and must be
/// idempotent on the same content.
#[async_trait]
pub trait Submitter: Send {
    async fn found_testcase(&mut self, testcase: &[u8]) -> anyhow::Result<()>;

    /// Memory reading of a probe encoding the next byte of the test case
    /// after `prefix`, restricted to bytes below `limit` (0 means the test
    /// case ends at `prefix`).
    async fn get_next_char(&mut self, prefix: &[u8], limit: u32) -> anyhow::Result<f64>;

    /// Memory reading of a probe encoding how many bytes represent the
    /// back-jump length (-1 means no more test cases).
    async fn get_prefix_length_length(&mut self, prefix: &[u8]) -> anyhow::Result<f64>;

    /// Memory reading of a probe encoding the byte at `position` of the
    /// back-jump length being assembled.
    async fn get_prefix_length(
        &mut self,
        prefix: &[u8],
        length_prefix: u64,
        position: u32,
    ) -> anyhow::Result<f64>;

    /// Memory reading of a calibration probe encoding `number`.
    async fn get_number(&mut self, number: i64) -> anyhow::Result<f64>;
}

/// Where a crawl is inside the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    NeedsPredict,
    FindingNextChar,
    FindingPrefixLengthLength,
    FindingPrefixLength,
    Done,
}

/// Serialisable crawl state at a safe point.
///
/// Invariant: any phase other than `NEEDS_PREDICT` carries finite model
/// coefficients; [`CrawlerCore::load_checkpoint`] enforces this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: Phase,
    #[serde(with = "crate::bytes")]
    pub prefix: Vec<u8>,
    pub limit: u32,
    pub prefix_length_length: u32,
    pub prefix_length: u64,
    pub position: i64,
    pub slope: Option<f64>,
    pub intercept: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("phase {0:?} requires fitted model coefficients")]
    MissingCoefficients(Phase),
    #[error("model coefficients must be finite")]
    NonFiniteCoefficients,
}

/// Protocol violations observed while interpreting decoded probe answers.
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("{probe} decoded to {value}, outside the expected range")]
    DecodedOutOfRange { probe: &'static str, value: i64 },
    #[error("back-jump length overflowed while assembling")]
    BackJumpOverflow,
    #[error("back-jump length {length} does not point inside the {prefix_len}-byte prefix")]
    BackJumpOutOfRange { length: u64, prefix_len: usize },
}

/// How a call to [`CrawlerCore::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The traversal reached `DONE`; every test case was emitted.
    Completed,
    /// The pause predicate fired; the in-memory state is a valid checkpoint.
    Paused,
}

pub struct CrawlerCore<S> {
    submitter: S,
    should_pause: Box<dyn Fn() -> bool + Send + Sync>,
    model: Option<LinearModel>,
    phase: Phase,
    prefix: Vec<u8>,
    limit: u32,
    prefix_length_length: u32,
    prefix_length: u64,
    position: i64,
}

impl<S: Submitter> CrawlerCore<S> {
    pub fn new(submitter: S, should_pause: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            submitter,
            should_pause: Box::new(should_pause),
            model: None,
            phase: Phase::NeedsPredict,
            prefix: Vec::new(),
            limit: 256,
            prefix_length_length: 0,
            prefix_length: 0,
            position: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Snapshot the full traversal state, including a partially assembled
    /// back-jump length and the in-flight digit position.
    pub fn save_checkpoint(&self) -> Checkpoint {
        let coefficients = self.model.as_ref().and_then(LinearModel::coefficients);
        Checkpoint {
            phase: self.phase,
            prefix: self.prefix.clone(),
            limit: self.limit,
            prefix_length_length: self.prefix_length_length,
            prefix_length: self.prefix_length,
            position: self.position,
            slope: coefficients.map(|c| c.slope),
            intercept: coefficients.map(|c| c.intercept),
        }
    }

    /// Restore the traversal state saved by [`save_checkpoint`].
    ///
    /// [`save_checkpoint`]: CrawlerCore::save_checkpoint
    pub fn load_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let coefficients = match (checkpoint.slope, checkpoint.intercept) {
            (Some(slope), Some(intercept)) => Some(Coefficients { slope, intercept }),
            _ => None,
        };
        match coefficients {
            Some(c) if !c.is_finite() => return Err(CheckpointError::NonFiniteCoefficients),
            None if checkpoint.phase != Phase::NeedsPredict => {
                return Err(CheckpointError::MissingCoefficients(checkpoint.phase));
            }
            _ => {}
        }

        self.phase = checkpoint.phase;
        self.prefix = checkpoint.prefix.clone();
        self.limit = checkpoint.limit;
        self.prefix_length_length = checkpoint.prefix_length_length;
        self.prefix_length = checkpoint.prefix_length;
        self.position = checkpoint.position;
        self.model = coefficients.map(LinearModel::from_coefficients);
        Ok(())
    }

    /// Run the traversal until completion, a pause request, or an error.
    ///
    /// Errors propagate without advancing past the failed probe; the caller
    /// is expected to persist [`save_checkpoint`] before recording the
    /// failure so the run can resume.
    ///
    /// [`save_checkpoint`]: CrawlerCore::save_checkpoint
    pub async fn run(&mut self) -> anyhow::Result<RunOutcome> {
        if self.phase == Phase::NeedsPredict {
            if let RunOutcome::Paused = self.calibrate().await? {
                return Ok(RunOutcome::Paused);
            }
            self.prefix.clear();
            self.limit = 256;
            self.phase = Phase::FindingNextChar;
        }

        while self.phase != Phase::Done {
            if (self.should_pause)() {
                return Ok(RunOutcome::Paused);
            }

            match self.phase {
                Phase::FindingNextChar => loop {
                    if (self.should_pause)() {
                        return Ok(RunOutcome::Paused);
                    }
                    let raw = self.submitter.get_next_char(&self.prefix, self.limit).await?;
                    let value = self.expect_byte("get_next_char", raw)?;
                    if value == 0 {
                        self.submitter.found_testcase(&self.prefix).await?;
                        self.phase = Phase::FindingPrefixLengthLength;
                        break;
                    }
                    self.prefix.push(value as u8);
                    self.limit = 256;
                },

                Phase::FindingPrefixLengthLength => {
                    let raw = self.submitter.get_prefix_length_length(&self.prefix).await?;
                    let value = self.decode(raw)?;
                    if value == -1 {
                        self.phase = Phase::Done;
                        continue;
                    }
                    if !(0..=255).contains(&value) {
                        return Err(CrawlError::DecodedOutOfRange {
                            probe: "get_prefix_length_length",
                            value,
                        }
                        .into());
                    }
                    self.prefix_length_length = value as u32;
                    self.prefix_length = 0;
                    self.position = i64::from(self.prefix_length_length) - 1;
                    self.phase = Phase::FindingPrefixLength;
                }

                Phase::FindingPrefixLength => {
                    // Most-significant digit first; `position` counts down so
                    // a checkpoint taken mid-assembly resumes at the right
                    // digit.
                    while self.position >= 0 {
                        if (self.should_pause)() {
                            return Ok(RunOutcome::Paused);
                        }
                        let raw = self
                            .submitter
                            .get_prefix_length(&self.prefix, self.prefix_length, self.position as u32)
                            .await?;
                        let digit = self.expect_byte("get_prefix_length", raw)?;
                        self.prefix_length = self
                            .prefix_length
                            .checked_mul(256)
                            .and_then(|v| v.checked_add(digit as u64))
                            .ok_or(CrawlError::BackJumpOverflow)?;
                        self.position -= 1;
                    }

                    let keep = self.prefix_length as usize;
                    let branch = *self.prefix.get(keep).ok_or(CrawlError::BackJumpOutOfRange {
                        length: self.prefix_length,
                        prefix_len: self.prefix.len(),
                    })?;
                    self.limit = u32::from(branch);
                    self.prefix.truncate(keep);
                    self.phase = Phase::FindingNextChar;
                }

                Phase::NeedsPredict | Phase::Done => break,
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Fit the measurement model by sampling `get_number` at -1, 63, 127,
    /// 191, 255. A pause here leaves the phase at `NEEDS_PREDICT`; the probes
    /// are repeatable, so calibration simply restarts on resume.
    async fn calibrate(&mut self) -> anyhow::Result<RunOutcome> {
        let mut model = LinearModel::new();
        for number in (-1_i64..256).step_by(64) {
            if (self.should_pause)() {
                return Ok(RunOutcome::Paused);
            }
            let memory = self.submitter.get_number(number).await?;
            model.add_point(memory, number as f64);
        }
        model.fit()?;
        self.model = Some(model);
        Ok(RunOutcome::Completed)
    }

    fn decode(&self, raw: f64) -> anyhow::Result<i64> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("probe decoded before the model was fitted"))?;
        Ok(model.decode(raw)?)
    }

    fn expect_byte(&self, probe: &'static str, raw: f64) -> anyhow::Result<i64> {
        let value = self.decode(raw)?;
        if !(0..=255).contains(&value) {
            return Err(CrawlError::DecodedOutOfRange { probe, value }.into());
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            phase: Phase::FindingPrefixLength,
            prefix: vec![0x00, 0x61, 0xff],
            limit: 97,
            prefix_length_length: 2,
            prefix_length: 1,
            position: 0,
            slope: Some(1.0 / 4096.0),
            intercept: Some(-64.0),
        }
    }

    #[test]
    fn checkpoint_json_round_trip_is_total() {
        let original = checkpoint();
        let json = serde_json::to_string(&original).expect("serialize");
        let back: Checkpoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, original);
    }

    #[test]
    fn phase_tags_are_stable() {
        let json = serde_json::to_string(&Phase::NeedsPredict).expect("serialize");
        assert_eq!(json, "\"NEEDS_PREDICT\"");
        let json = serde_json::to_string(&Phase::FindingPrefixLengthLength).expect("serialize");
        assert_eq!(json, "\"FINDING_PREFIX_LENGTH_LENGTH\"");
    }

    struct NeverSubmit;

    #[async_trait]
    impl Submitter for NeverSubmit {
        async fn found_testcase(&mut self, _testcase: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("not expected")
        }
        async fn get_next_char(&mut self, _prefix: &[u8], _limit: u32) -> anyhow::Result<f64> {
            anyhow::bail!("not expected")
        }
        async fn get_prefix_length_length(&mut self, _prefix: &[u8]) -> anyhow::Result<f64> {
            anyhow::bail!("not expected")
        }
        async fn get_prefix_length(
            &mut self,
            _prefix: &[u8],
            _length_prefix: u64,
            _position: u32,
        ) -> anyhow::Result<f64> {
            anyhow::bail!("not expected")
        }
        async fn get_number(&mut self, _number: i64) -> anyhow::Result<f64> {
            anyhow::bail!("not expected")
        }
    }

    #[test]
    fn load_restores_the_exact_saved_state() {
        let mut core = CrawlerCore::new(NeverSubmit, || false);
        core.load_checkpoint(&checkpoint()).expect("load");
        assert_eq!(core.save_checkpoint(), checkpoint());
    }

    #[test]
    fn load_rejects_advanced_phase_without_coefficients() {
        let mut broken = checkpoint();
        broken.slope = None;
        broken.intercept = None;
        let mut core = CrawlerCore::new(NeverSubmit, || false);
        assert!(matches!(
            core.load_checkpoint(&broken),
            Err(CheckpointError::MissingCoefficients(Phase::FindingPrefixLength))
        ));
    }

    #[test]
    fn load_rejects_non_finite_coefficients() {
        let mut broken = checkpoint();
        broken.slope = Some(f64::NAN);
        let mut core = CrawlerCore::new(NeverSubmit, || false);
        assert!(matches!(
            core.load_checkpoint(&broken),
            Err(CheckpointError::NonFiniteCoefficients)
        ));
    }

    #[test]
    fn fresh_checkpoint_carries_no_coefficients() {
        let core = CrawlerCore::new(NeverSubmit, || false);
        let saved = core.save_checkpoint();
        assert_eq!(saved.phase, Phase::NeedsPredict);
        assert_eq!(saved.slope, None);
        assert_eq!(saved.intercept, None);
    }
}
