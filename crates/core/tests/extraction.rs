//! End-to-end traversal scenarios against a scripted judge oracle.
//!
//! The oracle models the judge side of the channel: it owns a fixed corpus of
//! test cases and answers every probe the way the real probe programs would,
//! reporting a memory reading that linearly encodes the answer. The judge
//! reports the maximum reading across test cases, so at every branch the
//! traversal sees the largest candidate byte below `limit` and descends in
//! decreasing byte order.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ojc_core::crawler::{Checkpoint, CrawlError, CrawlerCore, Phase, RunOutcome, Submitter};

#[derive(Debug, Default)]
struct ProbeCounts {
    next_char: usize,
    prefix_length_length: usize,
    prefix_length: usize,
    number: usize,
}

impl ProbeCounts {
    fn total(&self) -> usize {
        self.next_char + self.prefix_length_length + self.prefix_length + self.number
    }
}

struct JudgeOracle {
    corpus: Vec<Vec<u8>>,
    // memory = slope * value + intercept
    slope: f64,
    intercept: f64,
    emitted: Vec<Vec<u8>>,
    found_calls: usize,
    counts: ProbeCounts,
}

impl JudgeOracle {
    fn new(corpus: &[&[u8]], slope: f64, intercept: f64) -> Self {
        Self {
            corpus: corpus.iter().map(|t| t.to_vec()).collect(),
            slope,
            intercept,
            emitted: Vec::new(),
            found_calls: 0,
            counts: ProbeCounts::default(),
        }
    }

    fn encode(&self, value: i64) -> f64 {
        self.slope * value as f64 + self.intercept
    }

    fn next_char(&self, prefix: &[u8], limit: u32) -> i64 {
        self.corpus
            .iter()
            .filter(|t| t.starts_with(prefix))
            .map(|t| {
                if t.len() == prefix.len() {
                    0
                } else {
                    i64::from(t[prefix.len()])
                }
            })
            .filter(|&v| v == 0 || (v as u32) < limit)
            .max()
            .unwrap_or(0)
    }

    /// Depth of the deepest branch point below `prefix` that still has
    /// unexplored candidates, or `None` when the traversal is finished.
    fn branch_depth(&self, prefix: &[u8]) -> Option<usize> {
        self.corpus
            .iter()
            .filter_map(|t| {
                let k = common_prefix_len(t, prefix);
                if k == t.len() && t.len() < prefix.len() {
                    // `t` is a proper prefix; its terminator is unexplored.
                    Some(k)
                } else if k < t.len() && k < prefix.len() && t[k] < prefix[k] {
                    Some(k)
                } else {
                    None
                }
            })
            .max()
    }

    fn prefix_length_length(&self, prefix: &[u8]) -> i64 {
        match self.branch_depth(prefix) {
            None => -1,
            Some(depth) => digits_base256(depth),
        }
    }

    fn prefix_length_digit(&self, prefix: &[u8], position: u32) -> i64 {
        let depth = self.branch_depth(prefix).unwrap_or(0) as u64;
        ((depth >> (8 * position)) & 0xff) as i64
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn digits_base256(mut n: usize) -> i64 {
    let mut digits = 1;
    while n >= 256 {
        n /= 256;
        digits += 1;
    }
    digits
}

#[derive(Clone)]
struct OracleSubmitter {
    oracle: Arc<Mutex<JudgeOracle>>,
}

impl OracleSubmitter {
    fn new(oracle: Arc<Mutex<JudgeOracle>>) -> Self {
        Self { oracle }
    }
}

#[async_trait]
impl Submitter for OracleSubmitter {
    async fn found_testcase(&mut self, testcase: &[u8]) -> anyhow::Result<()> {
        let mut oracle = self.oracle.lock().expect("oracle lock");
        oracle.found_calls += 1;
        if !oracle.emitted.iter().any(|t| t == testcase) {
            oracle.emitted.push(testcase.to_vec());
        }
        Ok(())
    }

    async fn get_next_char(&mut self, prefix: &[u8], limit: u32) -> anyhow::Result<f64> {
        let mut oracle = self.oracle.lock().expect("oracle lock");
        oracle.counts.next_char += 1;
        let answer = oracle.next_char(prefix, limit);
        Ok(oracle.encode(answer))
    }

    async fn get_prefix_length_length(&mut self, prefix: &[u8]) -> anyhow::Result<f64> {
        let mut oracle = self.oracle.lock().expect("oracle lock");
        oracle.counts.prefix_length_length += 1;
        let answer = oracle.prefix_length_length(prefix);
        Ok(oracle.encode(answer))
    }

    async fn get_prefix_length(
        &mut self,
        prefix: &[u8],
        _length_prefix: u64,
        position: u32,
    ) -> anyhow::Result<f64> {
        let mut oracle = self.oracle.lock().expect("oracle lock");
        oracle.counts.prefix_length += 1;
        let answer = oracle.prefix_length_digit(prefix, position);
        Ok(oracle.encode(answer))
    }

    async fn get_number(&mut self, number: i64) -> anyhow::Result<f64> {
        let mut oracle = self.oracle.lock().expect("oracle lock");
        oracle.counts.number += 1;
        Ok(oracle.encode(number))
    }
}

fn emitted(oracle: &Arc<Mutex<JudgeOracle>>) -> Vec<Vec<u8>> {
    oracle.lock().expect("oracle lock").emitted.clone()
}

#[tokio::test]
async fn fresh_run_extracts_the_whole_corpus() {
    let oracle = Arc::new(Mutex::new(JudgeOracle::new(&[b"ab", b"ac"], 1.0, 0.0)));
    let mut core = CrawlerCore::new(OracleSubmitter::new(oracle.clone()), || false);

    let outcome = core.run().await.expect("run");
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(core.phase(), Phase::Done);
    // Branches are explored in decreasing byte order.
    assert_eq!(emitted(&oracle), vec![b"ac".to_vec(), b"ab".to_vec()]);
}

#[tokio::test]
async fn decoding_survives_a_non_trivial_memory_map() {
    // memory = 4096 * value + 262144, the kind of numbers a judge reports.
    let oracle = Arc::new(Mutex::new(JudgeOracle::new(
        &[b"ab", b"ac", b"a", b"zz!z"],
        4096.0,
        262_144.0,
    )));
    let mut core = CrawlerCore::new(OracleSubmitter::new(oracle.clone()), || false);

    assert_eq!(core.run().await.expect("run"), RunOutcome::Completed);
    assert_eq!(
        emitted(&oracle),
        vec![
            b"zz!z".to_vec(),
            b"ac".to_vec(),
            b"ab".to_vec(),
            b"a".to_vec(),
        ]
    );
}

#[tokio::test]
async fn empty_testcase_corpus_emits_once_and_finishes() {
    let oracle = Arc::new(Mutex::new(JudgeOracle::new(&[b""], 1.0, 0.0)));
    let mut core = CrawlerCore::new(OracleSubmitter::new(oracle.clone()), || false);

    assert_eq!(core.run().await.expect("run"), RunOutcome::Completed);
    assert_eq!(emitted(&oracle), vec![Vec::<u8>::new()]);

    let guard = oracle.lock().expect("oracle lock");
    assert_eq!(guard.counts.next_char, 1);
    assert_eq!(guard.counts.prefix_length_length, 1);
    assert_eq!(guard.counts.prefix_length, 0);
}

#[tokio::test]
async fn pausing_at_every_probe_yields_the_same_extraction() {
    let corpus: &[&[u8]] = &[b"ab", b"ac", b"a"];

    // Reference: uninterrupted run.
    let reference = Arc::new(Mutex::new(JudgeOracle::new(corpus, 4096.0, 262_144.0)));
    let mut core = CrawlerCore::new(OracleSubmitter::new(reference.clone()), || false);
    assert_eq!(core.run().await.expect("run"), RunOutcome::Completed);
    let expected = emitted(&reference);
    let total_probes = reference.lock().expect("oracle lock").counts.total();

    for budget in 0..=total_probes {
        let oracle = Arc::new(Mutex::new(JudgeOracle::new(corpus, 4096.0, 262_144.0)));
        let pause_gate = oracle.clone();
        let mut first = CrawlerCore::new(OracleSubmitter::new(oracle.clone()), move || {
            pause_gate.lock().expect("oracle lock").counts.total() >= budget
        });

        match first.run().await.expect("first run") {
            RunOutcome::Completed => {
                assert_eq!(emitted(&oracle), expected, "budget {budget}");
                continue;
            }
            RunOutcome::Paused => {}
        }

        // The live state is the checkpoint; route it through JSON to prove
        // the serialized form loses nothing either.
        let saved = first.save_checkpoint();
        let json = serde_json::to_string(&saved).expect("serialize checkpoint");
        let restored: Checkpoint = serde_json::from_str(&json).expect("deserialize checkpoint");
        assert_eq!(restored, saved, "budget {budget}");

        let mut second = CrawlerCore::new(OracleSubmitter::new(oracle.clone()), || false);
        second.load_checkpoint(&restored).expect("load checkpoint");
        assert_eq!(
            second.run().await.expect("resumed run"),
            RunOutcome::Completed,
            "budget {budget}"
        );
        assert_eq!(emitted(&oracle), expected, "budget {budget}");
    }
}

#[tokio::test]
async fn resumes_mid_back_jump_assembly_with_one_digit_left() {
    // A 300-byte shared prefix forces a two-digit back-jump length: 300 is
    // 0x01 0x2c, so after folding in the high digit the checkpoint sits at
    // position 0 with one digit to go.
    let long: Vec<u8> = std::iter::repeat(b'a').take(300).collect();
    let mut longer = long.clone();
    longer.push(b'b');

    let oracle = Arc::new(Mutex::new(JudgeOracle::new(
        &[long.as_slice(), longer.as_slice()],
        1.0,
        0.0,
    )));

    let checkpoint = Checkpoint {
        phase: Phase::FindingPrefixLength,
        prefix: longer.clone(),
        limit: 256,
        prefix_length_length: 2,
        prefix_length: 1,
        position: 0,
        slope: Some(1.0),
        intercept: Some(0.0),
    };

    let mut core = CrawlerCore::new(OracleSubmitter::new(oracle.clone()), || false);
    core.load_checkpoint(&checkpoint).expect("load");
    assert_eq!(core.run().await.expect("run"), RunOutcome::Completed);

    let guard = oracle.lock().expect("oracle lock");
    assert_eq!(guard.counts.prefix_length, 1, "exactly one digit probe");
    assert_eq!(guard.emitted, vec![long]);
}

#[tokio::test]
async fn zero_length_back_jump_restarts_from_the_empty_prefix() {
    // Corpus branching at the very first byte: the back-jump truncates the
    // prefix to empty and scanning continues under the reduced limit.
    let oracle = Arc::new(Mutex::new(JudgeOracle::new(&[b"b", b"a"], 1.0, 0.0)));
    let mut core = CrawlerCore::new(OracleSubmitter::new(oracle.clone()), || false);

    assert_eq!(core.run().await.expect("run"), RunOutcome::Completed);
    assert_eq!(emitted(&oracle), vec![b"b".to_vec(), b"a".to_vec()]);
}

struct OutOfRangeSubmitter;

#[async_trait]
impl Submitter for OutOfRangeSubmitter {
    async fn found_testcase(&mut self, _testcase: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    async fn get_next_char(&mut self, _prefix: &[u8], _limit: u32) -> anyhow::Result<f64> {
        Ok(300.0)
    }
    async fn get_prefix_length_length(&mut self, _prefix: &[u8]) -> anyhow::Result<f64> {
        Ok(-1.0)
    }
    async fn get_prefix_length(
        &mut self,
        _prefix: &[u8],
        _length_prefix: u64,
        _position: u32,
    ) -> anyhow::Result<f64> {
        Ok(0.0)
    }
    async fn get_number(&mut self, number: i64) -> anyhow::Result<f64> {
        Ok(number as f64)
    }
}

#[tokio::test]
async fn out_of_range_decode_is_a_protocol_error() {
    let mut core = CrawlerCore::new(OutOfRangeSubmitter, || false);
    let err = core.run().await.expect_err("must fail");
    match err.downcast_ref::<CrawlError>() {
        Some(CrawlError::DecodedOutOfRange { probe, value }) => {
            assert_eq!(*probe, "get_next_char");
            assert_eq!(*value, 300);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // The failed state is still checkpointable.
    assert_eq!(core.save_checkpoint().phase, Phase::FindingNextChar);
}

#[tokio::test]
async fn found_testcase_is_idempotent_at_the_oracle() {
    let oracle = Arc::new(Mutex::new(JudgeOracle::new(&[b"x"], 1.0, 0.0)));
    let mut submitter = OracleSubmitter::new(oracle.clone());
    submitter.found_testcase(b"x").await.expect("first");
    submitter.found_testcase(b"x").await.expect("second");

    let guard = oracle.lock().expect("oracle lock");
    assert_eq!(guard.found_calls, 2);
    assert_eq!(guard.emitted, vec![b"x".to_vec()]);
}
