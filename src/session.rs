//! Broker session lifecycle and RPC dispatch.
//!
//! A session drives `idle → connecting → signing_on → context → ready`,
//! then dispatches RPCs with a timed read and a mock-data fallback. The
//! fallback exists because the authentic wire format is not fully known:
//! a read timeout degrades gracefully to canned data instead of failing
//! the caller.
//!
//! One session is the unit of concurrency control: lifecycle and dispatch
//! run under the session's own async mutex, so concurrent callers of
//! [`ensure`](BrokerSession::ensure) share one in-flight lifecycle instead
//! of racing duplicate sign-ons.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::capture::BrokerCapture;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::metrics::BrokerMetrics;
use crate::parser::{parse_patient_list, ParseIssue, PatientRecord};
use crate::protocol::{create_default_codec, sanitize_for_log, FrameCodec};
use crate::transport::{BrokerTransport, MockTransport, SocketTransport, SAMPLE_PATIENT_LINES};

/// Sign-on setup RPC (no parameters).
pub const RPC_SIGNON_SETUP: &str = "XUS SIGNON SETUP";

/// Access/verify-code exchange RPC.
pub const RPC_AV_CODE: &str = "XUS AV CODE";

/// Context establishment RPC.
pub const RPC_SET_CONTEXT: &str = "XWB SET CONTEXT";

/// Patient-list RPC names with a dedicated structured parser.
pub const PATIENT_LIST_RPCS: [&str; 2] = ["ORWPT LIST", "ORWPT LIST ALL"];

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    SigningOn,
    Context,
    Ready,
    Closed,
    Error,
}

impl SessionState {
    /// Stable string form used as a metrics key.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::SigningOn => "signing_on",
            SessionState::Context => "context",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
            SessionState::Error => "error",
        }
    }
}

/// Structured payload attached to patient-list call outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredResult {
    pub patients: Vec<PatientRecord>,
    pub issues: Vec<ParseIssue>,
}

/// Outcome of one [`BrokerSession::call`].
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Whether the call produced usable lines.
    pub ok: bool,
    /// Response body lines.
    pub lines: Vec<String>,
    /// True when no network attempt occurred or the attempt yielded nothing
    /// usable and canned data was substituted.
    pub mock: bool,
    /// Parsed structure for patient-list RPCs.
    pub structured: Option<StructuredResult>,
}

struct SessionInner {
    state: SessionState,
    authenticated: bool,
    context_set: bool,
    last_used: Option<Instant>,
    transport: Box<dyn BrokerTransport>,
}

/// Long-lived broker session.
///
/// Owns its transport and codec exclusively. [`destroy`](Self::destroy)
/// releases the transport deterministically and is safe to call multiple
/// times; a destroyed session fails fast instead of silently reconnecting.
pub struct BrokerSession {
    config: BrokerConfig,
    metrics: Arc<BrokerMetrics>,
    capture: Arc<BrokerCapture>,
    codec: Box<dyn FrameCodec>,
    inner: Mutex<SessionInner>,
}

impl BrokerSession {
    /// Create a session with the transport implied by the configuration:
    /// a real socket in experimental mode, the in-memory mock otherwise.
    pub fn new(
        config: BrokerConfig,
        metrics: Arc<BrokerMetrics>,
        capture: Arc<BrokerCapture>,
    ) -> Self {
        let transport: Box<dyn BrokerTransport> = if config.experimental {
            Box::new(SocketTransport::new(&config, metrics.clone(), capture.clone()))
        } else {
            Box::new(MockTransport::new())
        };
        Self::with_transport(config, metrics, capture, transport)
    }

    /// Create a session around an explicitly injected transport.
    pub fn with_transport(
        config: BrokerConfig,
        metrics: Arc<BrokerMetrics>,
        capture: Arc<BrokerCapture>,
        transport: Box<dyn BrokerTransport>,
    ) -> Self {
        let codec = create_default_codec(&config, metrics.clone());
        metrics.set_mode(config.experimental);
        metrics.transition_session_state(SessionState::Idle.as_str());
        Self {
            config,
            metrics,
            capture,
            codec,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                authenticated: false,
                context_set: false,
                last_used: None,
                transport,
            }),
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Drive the session to `ready`, reusing it when recently used.
    ///
    /// Concurrent callers serialize on the session and observe the one
    /// in-flight lifecycle's outcome; sign-on and context-set each run at
    /// most once per session lifetime.
    pub async fn ensure(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.lifecycle(&mut inner).await
    }

    /// Release the transport and transition to `closed`.
    pub async fn destroy(&self) {
        let mut inner = self.inner.lock().await;
        inner.transport.destroy();
        self.transition(&mut inner, SessionState::Closed);
    }

    /// Invoke an RPC.
    ///
    /// Legacy (non-experimental) mode serves deterministic mock data with no
    /// transport involved. Experimental mode ensures the session is ready,
    /// sends the encoded frame and attempts a timed read; a timeout or
    /// unusable response falls back to the same mock data. Latency and
    /// per-RPC metrics are recorded on every path.
    pub async fn call(&self, rpc_name: &str, params: &[String]) -> Result<CallOutcome> {
        let mut inner = self.inner.lock().await;

        if !self.config.experimental {
            let start = Instant::now();
            let outcome = self.mock_call(rpc_name, params);
            let duration_ms = start.elapsed().as_millis() as u64;
            self.metrics.record(rpc_name, duration_ms, outcome.ok);
            self.metrics.record_rpc_e2e_latency(duration_ms);
            return Ok(outcome);
        }

        self.lifecycle(&mut inner).await?;
        let start = Instant::now();
        let encoded = self.codec.encode(rpc_name, params);
        tracing::debug!(rpc = rpc_name, debug = %encoded.debug, "encoded rpc");

        let frame = encoded
            .length_prefixed
            .clone()
            .unwrap_or_else(|| encoded.raw.clone());
        let mut lines: Vec<String> = Vec::new();
        let mut network_attempted = false;
        let mut network_usable = false;

        self.capture
            .record_send(&frame, json!({ "phase": "rpc", "rpc": rpc_name }));
        match inner.transport.send(&frame).await {
            Ok(()) => {
                network_attempted = true;
                match inner.transport.read(self.config.rpc_timeout).await {
                    Ok(Some(buf)) => {
                        self.capture
                            .record_recv(&buf, json!({ "phase": "rpc", "rpc": rpc_name }));
                        let decoded = self.codec.decode(&buf, encoded.length_prefixed.is_some());
                        if decoded.ok && !decoded.lines.is_empty() {
                            lines = decoded.lines;
                            network_usable = true;
                        }
                    }
                    Ok(None) => {
                        self.metrics.record_rpc_timeout();
                    }
                    Err(e) => {
                        tracing::warn!(rpc = rpc_name, error = %e, "transport read failed; falling back to mock");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(rpc = rpc_name, error = %e, "transport send failed; falling back to mock");
            }
        }

        if lines.is_empty() && is_patient_list(rpc_name) {
            lines = sample_patient_lines(params.first().map(String::as_str));
        }
        if lines.is_empty() {
            lines = vec!["RESULT".to_string()];
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        self.metrics.record(rpc_name, duration_ms, true);
        self.metrics.record_rpc_e2e_latency(duration_ms);
        inner.last_used = Some(Instant::now());
        tracing::debug!(
            rpc = rpc_name,
            duration_ms,
            lines = %sanitize_for_log(&lines),
            "rpc complete"
        );

        let structured = is_patient_list(rpc_name).then(|| self.parse_and_record(&lines));
        Ok(CallOutcome {
            ok: true,
            lines,
            mock: !(network_attempted && network_usable),
            structured,
        })
    }

    /// Legacy mock path: deterministic data, no transport.
    fn mock_call(&self, rpc_name: &str, params: &[String]) -> CallOutcome {
        if !is_patient_list(rpc_name) {
            return CallOutcome {
                ok: false,
                lines: vec!["RPC_NOT_IMPLEMENTED".to_string()],
                mock: true,
                structured: None,
            };
        }
        let lines = sample_patient_lines(params.first().map(String::as_str));
        let structured = self.parse_and_record(&lines);
        CallOutcome {
            ok: true,
            lines,
            mock: true,
            structured: Some(structured),
        }
    }

    async fn lifecycle(&self, inner: &mut SessionInner) -> Result<()> {
        match inner.state {
            SessionState::Closed => return Err(BrokerError::Closed),
            SessionState::Ready => {
                let within_window = inner
                    .last_used
                    .map(|t| t.elapsed() < self.config.idle_window)
                    .unwrap_or(false);
                if within_window {
                    inner.last_used = Some(Instant::now());
                    return Ok(());
                }
            }
            _ => {}
        }

        self.transition(inner, SessionState::Connecting);
        if let Err(e) = inner.transport.connect().await {
            self.transition(inner, SessionState::Error);
            return Err(e);
        }
        if let Err(e) = self.perform_sign_on(inner).await {
            self.transition(inner, SessionState::Error);
            return Err(e);
        }
        self.transition(inner, SessionState::Context);
        if let Err(e) = self.set_context(inner).await {
            self.transition(inner, SessionState::Error);
            return Err(e);
        }
        self.transition(inner, SessionState::Ready);
        inner.last_used = Some(Instant::now());
        tracing::info!(context = %self.config.context, "session ready");
        Ok(())
    }

    /// Sign on with the setup RPC then the access/verify exchange.
    /// Idempotent: runs at most once per session lifetime.
    async fn perform_sign_on(&self, inner: &mut SessionInner) -> Result<()> {
        if inner.authenticated {
            return Ok(());
        }
        self.transition(inner, SessionState::SigningOn);
        tracing::info!(length_prefix = self.config.length_prefix, "sign-on start");
        let start = Instant::now();

        let result = self.sign_on_exchange(inner).await;
        match result {
            Ok(()) => {
                inner.authenticated = true;
                self.metrics
                    .record_sign_on(true, start.elapsed().as_millis() as u64);
                tracing::info!("sign-on success");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_sign_on(false, 0);
                tracing::error!(error = %e, "sign-on failed");
                Err(e)
            }
        }
    }

    async fn sign_on_exchange(&self, inner: &mut SessionInner) -> Result<()> {
        if !self.config.length_prefix {
            return Ok(());
        }
        self.rpc_step(inner, "signon", RPC_SIGNON_SETUP, &[]).await?;
        let av_pair = format!("{}^{}", self.config.access_code, self.config.verify_code);
        self.rpc_step(inner, "signon", RPC_AV_CODE, &[av_pair]).await
    }

    /// Establish the clinical context. Idempotent; skipped (with a warning)
    /// when no context is configured.
    async fn set_context(&self, inner: &mut SessionInner) -> Result<()> {
        if inner.context_set {
            return Ok(());
        }
        if self.config.context.is_empty() {
            tracing::warn!("no context configured; skipping context set");
            inner.context_set = true;
            return Ok(());
        }
        tracing::info!(context = %self.config.context, "set context");
        if self.config.length_prefix {
            let context = self.config.context.clone();
            self.rpc_step(inner, "context", RPC_SET_CONTEXT, &[context])
                .await?;
        }
        inner.context_set = true;
        Ok(())
    }

    /// One lifecycle RPC exchange: encode, capture, send, timed read.
    /// Responses are decoded and traced, not interpreted.
    async fn rpc_step(
        &self,
        inner: &mut SessionInner,
        phase: &str,
        rpc: &str,
        params: &[String],
    ) -> Result<()> {
        let encoded = self.codec.encode(rpc, params);
        let Some(frame) = encoded.length_prefixed.as_ref() else {
            return Ok(());
        };
        tracing::debug!(rpc, bytes = frame.len(), "lifecycle frame");
        self.capture
            .record_send(frame, json!({ "phase": phase, "rpc": rpc }));
        inner.transport.send(frame).await?;
        if let Some(buf) = inner.transport.read(self.config.rpc_timeout).await? {
            self.capture
                .record_recv(&buf, json!({ "phase": phase, "rpc": rpc }));
            let decoded = self.codec.decode(&buf, true);
            tracing::debug!(
                rpc,
                ok = decoded.ok,
                lines = %sanitize_for_log(&decoded.lines),
                "lifecycle response"
            );
        }
        Ok(())
    }

    fn parse_and_record(&self, lines: &[String]) -> StructuredResult {
        let outcome = parse_patient_list(lines, self.config.strict_dob);
        self.metrics
            .record_parsed_patients(outcome.patients.len() as u64);
        self.metrics
            .record_parse_dob_normalized(outcome.stats.dob_normalized);
        self.metrics
            .record_parse_dob_invalid(outcome.stats.dob_invalid);
        self.metrics
            .record_parse_gender_omitted(outcome.stats.gender_omitted);
        self.metrics
            .record_parse_name_split_failed(outcome.stats.name_split_failed);
        self.metrics
            .record_parse_dropped_strict_dob(outcome.stats.dropped_for_strict_dob);
        if !outcome.issues.is_empty() {
            self.metrics.record_parse_issues(outcome.issues.len() as u64);
            for issue in &outcome.issues {
                self.metrics.record_parse_issue_reason(issue.reason.as_str());
            }
        }
        StructuredResult {
            patients: outcome.patients,
            issues: outcome.issues,
        }
    }

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        inner.state = next;
        self.metrics.transition_session_state(next.as_str());
    }
}

fn is_patient_list(rpc_name: &str) -> bool {
    PATIENT_LIST_RPCS.contains(&rpc_name)
}

/// Canned patient-list lines, filtered by a case-insensitive substring.
fn sample_patient_lines(filter: Option<&str>) -> Vec<String> {
    let needle = filter.unwrap_or("").to_lowercase();
    SAMPLE_PATIENT_LINES
        .iter()
        .filter(|l| needle.is_empty() || l.to_lowercase().contains(&needle))
        .map(|l| l.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session_with(config: BrokerConfig) -> (BrokerSession, Arc<BrokerMetrics>) {
        let metrics = Arc::new(BrokerMetrics::new());
        let capture = Arc::new(BrokerCapture::new(&config, metrics.clone()));
        let transport = Box::new(MockTransport::with_latency(Duration::from_millis(1)));
        (
            BrokerSession::with_transport(config, metrics.clone(), capture, transport),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_legacy_mode_serves_mock_patient_list() {
        let (session, _) = session_with(BrokerConfig {
            experimental: false,
            ..BrokerConfig::default()
        });

        let outcome = session.call("ORWPT LIST ALL", &[]).await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.mock);
        assert_eq!(outcome.lines.len(), 4);
        let structured = outcome.structured.unwrap();
        assert_eq!(structured.patients.len(), 4);
        assert!(structured.issues.is_empty());

        // No transport involved: session never left idle
        assert_eq!(session.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_legacy_mode_filter_applies() {
        let (session, _) = session_with(BrokerConfig {
            experimental: false,
            ..BrokerConfig::default()
        });
        let outcome = session
            .call("ORWPT LIST", &["alvarez".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.lines.len(), 1);
        assert!(outcome.lines[0].contains("ALVAREZ"));
    }

    #[tokio::test]
    async fn test_legacy_mode_unknown_rpc_not_implemented() {
        let (session, _) = session_with(BrokerConfig {
            experimental: false,
            ..BrokerConfig::default()
        });
        let outcome = session.call("XUS GET USER INFO", &[]).await.unwrap();
        assert!(!outcome.ok);
        assert!(outcome.mock);
        assert_eq!(outcome.lines, vec!["RPC_NOT_IMPLEMENTED"]);
    }

    #[tokio::test]
    async fn test_experimental_call_over_mock_transport() {
        let (session, metrics) = session_with(BrokerConfig::default());

        let outcome = session.call("ORWPT LIST ALL", &[]).await.unwrap();
        assert!(outcome.ok);
        // Usable network lines came back from the loopback
        assert!(!outcome.mock);
        assert_eq!(outcome.lines.len(), 4);
        assert_eq!(session.state().await, SessionState::Ready);

        let snap = metrics.snapshot();
        assert_eq!(snap.sign_on.attempts, 1);
        assert_eq!(snap.rpc["ORWPT LIST ALL"].count, 1);
        assert_eq!(snap.rpc_e2e.count, 1);
        assert_eq!(snap.parsing.patients, 4);
        assert_eq!(snap.session_state, "ready");
    }

    #[tokio::test]
    async fn test_ensure_reuses_ready_session() {
        let (session, metrics) = session_with(BrokerConfig::default());
        session.ensure().await.unwrap();
        session.ensure().await.unwrap();
        session.ensure().await.unwrap();

        assert_eq!(metrics.snapshot().sign_on.attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_single_sign_on() {
        let (session, metrics) = session_with(BrokerConfig::default());
        let session = Arc::new(session);

        let a = session.clone();
        let b = session.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.ensure().await }),
            tokio::spawn(async move { b.ensure().await }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        assert_eq!(metrics.snapshot().sign_on.attempts, 1);
    }

    #[tokio::test]
    async fn test_destroy_then_ensure_fails_fast() {
        let (session, _) = session_with(BrokerConfig::default());
        session.ensure().await.unwrap();
        session.destroy().await;
        assert_eq!(session.state().await, SessionState::Closed);

        // Safe to destroy twice
        session.destroy().await;

        assert!(matches!(session.ensure().await, Err(BrokerError::Closed)));
        assert!(matches!(
            session.call("ORWPT LIST", &[]).await,
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_sign_on_and_context_run_once_per_lifetime() {
        let config = BrokerConfig {
            idle_window: Duration::from_millis(0),
            ..BrokerConfig::default()
        };
        let (session, metrics) = session_with(config);

        // Idle window of zero forces the full lifecycle on each ensure, but
        // the idempotence flags keep sign-on and context-set from repeating.
        session.ensure().await.unwrap();
        session.ensure().await.unwrap();

        assert_eq!(metrics.snapshot().sign_on.attempts, 1);
    }

    #[tokio::test]
    async fn test_context_skipped_when_unconfigured() {
        let (session, _) = session_with(BrokerConfig {
            context: String::new(),
            ..BrokerConfig::default()
        });
        session.ensure().await.unwrap();
        assert_eq!(session.state().await, SessionState::Ready);
    }
}
