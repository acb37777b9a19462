//! In-memory metrics aggregator.
//!
//! Lightweight counters and latency histograms for the broker engine,
//! independent of every other component but written to by all of them.
//! Components receive an `Arc<BrokerMetrics>` at construction rather than
//! reaching for a shared instance at call time, so tests can observe
//! isolated instances.
//!
//! All mutation happens behind one mutex; [`BrokerMetrics::snapshot`] is a
//! pure projection and [`BrokerMetrics::reset`] clears every counter
//! atomically for test isolation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;

/// Bounded per-RPC sample window used for p95 estimation.
pub const MAX_RPC_SAMPLES: usize = 50;

/// Decode-latency histogram bucket upper bounds, in milliseconds.
pub const DECODE_LATENCY_BUCKETS_MS: [u64; 10] = [1, 2, 5, 10, 20, 50, 100, 250, 500, 1000];

/// End-to-end RPC latency histogram bucket upper bounds, in milliseconds.
pub const RPC_E2E_BUCKETS_MS: [u64; 10] = [5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000];

/// Reserved aggregate name for sign-on timing.
pub const SIGNON_RPC_NAME: &str = "__SIGNON__";

/// Per-RPC aggregate as reported by [`BrokerMetrics::snapshot`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RpcAggregateSnapshot {
    pub count: u64,
    pub errors: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
    pub p95_ms: u64,
}

/// Sign-on attempt counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SignOnSnapshot {
    pub attempts: u64,
    pub errors: u64,
}

/// Frame assembly and multi-part counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FrameSnapshot {
    pub seen: u64,
    pub complete: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub continuations: u64,
    pub multipart_exceeded: u64,
    pub multipart_started: u64,
    pub multipart_completed: u64,
    pub multipart_checksum: Option<String>,
}

/// Response parse quality counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ParsingSnapshot {
    pub issues: u64,
    pub issue_reasons: BTreeMap<String, u64>,
    pub patients: u64,
    pub dob_normalized: u64,
    pub dob_invalid: u64,
    pub gender_omitted: u64,
    pub name_split_failed: u64,
    pub dropped_for_strict_dob: u64,
}

/// Header-parse error counters with reason breakdown.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HeaderSnapshot {
    pub errors: u64,
    pub reasons: BTreeMap<String, u64>,
}

/// Redaction rule hit counters.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RedactionSnapshot {
    pub applied: u64,
    pub rules: BTreeMap<String, u64>,
}

/// Fixed-bucket latency histogram with a cumulative overflow bucket.
///
/// `counts` has one more entry than `buckets`; the final slot counts samples
/// above the last boundary (the `+Inf` bucket).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistogramSnapshot {
    pub buckets: Vec<u64>,
    pub counts: Vec<u64>,
    pub sum: u64,
    pub count: u64,
}

/// Full metrics snapshot, serializable for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub rpc: BTreeMap<String, RpcAggregateSnapshot>,
    pub mode: String,
    pub sign_on: SignOnSnapshot,
    pub frames: FrameSnapshot,
    pub parsing: ParsingSnapshot,
    pub header: HeaderSnapshot,
    pub redaction: RedactionSnapshot,
    pub decode_latency: HistogramSnapshot,
    pub rpc_e2e: HistogramSnapshot,
    pub rpc_timeouts: u64,
    pub session_state: String,
    pub session_state_dwell_ms: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct RpcAggregate {
    count: u64,
    errors: u64,
    total_ms: u64,
    max_ms: u64,
    samples: Vec<u64>,
}

impl RpcAggregate {
    fn new() -> Self {
        Self {
            count: 0,
            errors: 0,
            total_ms: 0,
            max_ms: 0,
            samples: Vec::new(),
        }
    }

    fn record(&mut self, duration_ms: u64, ok: bool) {
        self.count += 1;
        if !ok {
            self.errors += 1;
        }
        self.total_ms += duration_ms;
        if duration_ms > self.max_ms {
            self.max_ms = duration_ms;
        }
        self.samples.push(duration_ms);
        if self.samples.len() > MAX_RPC_SAMPLES {
            self.samples.remove(0);
        }
    }

    fn snapshot(&self) -> RpcAggregateSnapshot {
        let avg = self.total_ms as f64 / self.count as f64;
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        // p95 by sort-and-index over the bounded window
        let idx = ((sorted.len() as f64 * 0.95).floor() as usize).saturating_sub(1);
        let p95 = sorted[idx.min(sorted.len() - 1)];
        RpcAggregateSnapshot {
            count: self.count,
            errors: self.errors,
            avg_ms: (avg * 100.0).round() / 100.0,
            max_ms: self.max_ms,
            p95_ms: p95,
        }
    }
}

#[derive(Debug)]
struct Histogram {
    buckets: &'static [u64],
    counts: Vec<u64>,
    sum: u64,
    count: u64,
}

impl Histogram {
    fn new(buckets: &'static [u64]) -> Self {
        Self {
            buckets,
            counts: vec![0; buckets.len() + 1],
            sum: 0,
            count: 0,
        }
    }

    fn record(&mut self, ms: u64) {
        self.sum += ms;
        self.count += 1;
        for (i, bound) in self.buckets.iter().enumerate() {
            if ms <= *bound {
                self.counts[i] += 1;
                return;
            }
        }
        // overflow (+Inf) bucket
        let last = self.counts.len() - 1;
        self.counts[last] += 1;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.to_vec(),
            counts: self.counts.clone(),
            sum: self.sum,
            count: self.count,
        }
    }

    fn reset(&mut self) {
        self.counts = vec![0; self.buckets.len() + 1];
        self.sum = 0;
        self.count = 0;
    }
}

#[derive(Debug)]
struct MetricsInner {
    aggregates: BTreeMap<String, RpcAggregate>,
    mode: String,
    sign_on_count: u64,
    sign_on_errors: u64,
    frames_seen: u64,
    frames_complete: u64,
    frame_errors: u64,
    last_frame_error: Option<String>,
    frame_continuations: u64,
    frame_multipart_exceeded: u64,
    frame_multipart_started: u64,
    frame_multipart_completed: u64,
    frame_multipart_checksum: Option<String>,
    parse_issues: u64,
    parse_issue_reasons: BTreeMap<String, u64>,
    parse_patients: u64,
    parse_dob_normalized: u64,
    parse_dob_invalid: u64,
    parse_gender_omitted: u64,
    parse_name_split_failed: u64,
    parse_dropped_strict_dob: u64,
    header_errors: u64,
    header_error_reasons: BTreeMap<String, u64>,
    redaction_applied: u64,
    redaction_rule_counts: BTreeMap<String, u64>,
    decode_latency: Histogram,
    rpc_e2e: Histogram,
    rpc_timeouts: u64,
    session_state: String,
    session_state_entered: Instant,
    session_state_dwell_ms: BTreeMap<String, u64>,
}

impl MetricsInner {
    fn new() -> Self {
        Self {
            aggregates: BTreeMap::new(),
            mode: "mock".to_string(),
            sign_on_count: 0,
            sign_on_errors: 0,
            frames_seen: 0,
            frames_complete: 0,
            frame_errors: 0,
            last_frame_error: None,
            frame_continuations: 0,
            frame_multipart_exceeded: 0,
            frame_multipart_started: 0,
            frame_multipart_completed: 0,
            frame_multipart_checksum: None,
            parse_issues: 0,
            parse_issue_reasons: BTreeMap::new(),
            parse_patients: 0,
            parse_dob_normalized: 0,
            parse_dob_invalid: 0,
            parse_gender_omitted: 0,
            parse_name_split_failed: 0,
            parse_dropped_strict_dob: 0,
            header_errors: 0,
            header_error_reasons: BTreeMap::new(),
            redaction_applied: 0,
            redaction_rule_counts: BTreeMap::new(),
            decode_latency: Histogram::new(&DECODE_LATENCY_BUCKETS_MS),
            rpc_e2e: Histogram::new(&RPC_E2E_BUCKETS_MS),
            rpc_timeouts: 0,
            session_state: "idle".to_string(),
            session_state_entered: Instant::now(),
            session_state_dwell_ms: BTreeMap::new(),
        }
    }
}

/// Process-wide metrics aggregator.
///
/// Safe for concurrent use; counters are monotonically non-decreasing
/// between [`reset`](Self::reset) calls.
#[derive(Debug)]
pub struct BrokerMetrics {
    inner: Mutex<MetricsInner>,
}

impl BrokerMetrics {
    /// Create a fresh aggregator with all counters zeroed.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner::new()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, MetricsInner> {
        self.inner.lock().expect("metrics mutex poisoned")
    }

    /// Record one RPC outcome for the named RPC.
    pub fn record(&self, rpc: &str, duration_ms: u64, ok: bool) {
        let mut inner = self.locked();
        inner
            .aggregates
            .entry(rpc.to_string())
            .or_insert_with(RpcAggregate::new)
            .record(duration_ms, ok);
    }

    /// Record a sign-on attempt outcome.
    pub fn record_sign_on(&self, ok: bool, duration_ms: u64) {
        {
            let mut inner = self.locked();
            inner.sign_on_count += 1;
            if !ok {
                inner.sign_on_errors += 1;
            }
        }
        self.record(SIGNON_RPC_NAME, duration_ms, ok);
    }

    /// Count one inbound chunk handed to the frame assembler.
    pub fn record_frame_chunk(&self) {
        self.locked().frames_seen += 1;
    }

    /// Count one completed frame extraction.
    pub fn record_frame_complete(&self) {
        self.locked().frames_complete += 1;
    }

    /// Count one frame assembly error, retaining the code for the snapshot.
    pub fn record_frame_error(&self, code: &str) {
        let mut inner = self.locked();
        inner.frame_errors += 1;
        inner.last_frame_error = Some(code.to_string());
    }

    /// Count one continuation marker observed by the state machine.
    pub fn record_frame_continuation(&self) {
        self.locked().frame_continuations += 1;
    }

    /// Count one multi-part accumulation that exceeded the size guard.
    pub fn record_frame_multipart_exceeded(&self) {
        self.locked().frame_multipart_exceeded += 1;
    }

    /// Count the start of a multi-part sequence.
    pub fn record_frame_multipart_start(&self) {
        self.locked().frame_multipart_started += 1;
    }

    /// Count the completion of a multi-part sequence.
    pub fn record_frame_multipart_complete(&self) {
        self.locked().frame_multipart_completed += 1;
    }

    /// Retain the most recent multi-part content checksum.
    pub fn set_frame_multipart_checksum(&self, checksum: String) {
        self.locked().frame_multipart_checksum = Some(checksum);
    }

    /// Add to the parse issue total.
    pub fn record_parse_issues(&self, count: u64) {
        self.locked().parse_issues += count;
    }

    /// Count one parse issue under its reason.
    pub fn record_parse_issue_reason(&self, reason: &str) {
        let mut inner = self.locked();
        *inner
            .parse_issue_reasons
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    /// Add to the parsed patient record total.
    pub fn record_parsed_patients(&self, count: u64) {
        self.locked().parse_patients += count;
    }

    /// Add to the DOB-normalized counter.
    pub fn record_parse_dob_normalized(&self, count: u64) {
        self.locked().parse_dob_normalized += count;
    }

    /// Add to the invalid-DOB counter.
    pub fn record_parse_dob_invalid(&self, count: u64) {
        self.locked().parse_dob_invalid += count;
    }

    /// Add to the gender-omitted counter.
    pub fn record_parse_gender_omitted(&self, count: u64) {
        self.locked().parse_gender_omitted += count;
    }

    /// Add to the name-split-failure counter.
    pub fn record_parse_name_split_failed(&self, count: u64) {
        self.locked().parse_name_split_failed += count;
    }

    /// Add to the strict-DOB-drop counter.
    pub fn record_parse_dropped_strict_dob(&self, count: u64) {
        self.locked().parse_dropped_strict_dob += count;
    }

    /// Count one header-parse error under its reason.
    pub fn record_header_error(&self, reason: &str) {
        let mut inner = self.locked();
        inner.header_errors += 1;
        *inner
            .header_error_reasons
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    /// Count one redaction application with the rules that matched.
    pub fn record_redaction(&self, rules: &[String]) {
        if rules.is_empty() {
            return;
        }
        let mut inner = self.locked();
        inner.redaction_applied += 1;
        for rule in rules {
            *inner.redaction_rule_counts.entry(rule.clone()).or_insert(0) += 1;
        }
    }

    /// Record one frame decode latency sample.
    pub fn record_decode_latency(&self, ms: u64) {
        self.locked().decode_latency.record(ms);
    }

    /// Record one end-to-end RPC latency sample.
    pub fn record_rpc_e2e_latency(&self, ms: u64) {
        self.locked().rpc_e2e.record(ms);
    }

    /// Count one RPC read timeout.
    pub fn record_rpc_timeout(&self) {
        self.locked().rpc_timeouts += 1;
    }

    /// Set the reported engine mode.
    pub fn set_mode(&self, experimental: bool) {
        self.locked().mode = if experimental { "experimental" } else { "mock" }.to_string();
    }

    /// Move the session-state gauge, crediting dwell time to the state
    /// being left.
    pub fn transition_session_state(&self, next: &str) {
        let mut inner = self.locked();
        let delta = inner.session_state_entered.elapsed().as_millis() as u64;
        let prev = inner.session_state.clone();
        *inner.session_state_dwell_ms.entry(prev).or_insert(0) += delta;
        inner.session_state = next.to_string();
        inner.session_state_entered = Instant::now();
    }

    /// Produce a full snapshot. Pure read; never mutates state.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.locked();
        MetricsSnapshot {
            rpc: inner
                .aggregates
                .iter()
                .map(|(rpc, agg)| (rpc.clone(), agg.snapshot()))
                .collect(),
            mode: inner.mode.clone(),
            sign_on: SignOnSnapshot {
                attempts: inner.sign_on_count,
                errors: inner.sign_on_errors,
            },
            frames: FrameSnapshot {
                seen: inner.frames_seen,
                complete: inner.frames_complete,
                errors: inner.frame_errors,
                last_error: inner.last_frame_error.clone(),
                continuations: inner.frame_continuations,
                multipart_exceeded: inner.frame_multipart_exceeded,
                multipart_started: inner.frame_multipart_started,
                multipart_completed: inner.frame_multipart_completed,
                multipart_checksum: inner.frame_multipart_checksum.clone(),
            },
            parsing: ParsingSnapshot {
                issues: inner.parse_issues,
                issue_reasons: inner.parse_issue_reasons.clone(),
                patients: inner.parse_patients,
                dob_normalized: inner.parse_dob_normalized,
                dob_invalid: inner.parse_dob_invalid,
                gender_omitted: inner.parse_gender_omitted,
                name_split_failed: inner.parse_name_split_failed,
                dropped_for_strict_dob: inner.parse_dropped_strict_dob,
            },
            header: HeaderSnapshot {
                errors: inner.header_errors,
                reasons: inner.header_error_reasons.clone(),
            },
            redaction: RedactionSnapshot {
                applied: inner.redaction_applied,
                rules: inner.redaction_rule_counts.clone(),
            },
            decode_latency: inner.decode_latency.snapshot(),
            rpc_e2e: inner.rpc_e2e.snapshot(),
            rpc_timeouts: inner.rpc_timeouts,
            session_state: inner.session_state.clone(),
            session_state_dwell_ms: inner.session_state_dwell_ms.clone(),
        }
    }

    /// Clear all counters back to their initial state.
    pub fn reset(&self) {
        let mut inner = self.locked();
        let mode = inner.mode.clone();
        *inner = MetricsInner::new();
        inner.mode = mode;
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
