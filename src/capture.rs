//! Diagnostic capture with PHI redaction.
//!
//! Three independently flag-gated sinks:
//!
//! - greeting capture: the first inbound buffer only, bounded, in memory
//! - frame-chunk capture: a bounded rolling window of inbound chunks
//! - raw capture: one redacted JSON artifact per send/receive on disk
//!
//! Redaction applies an ordered rule list (SSN, DOB, "Last, First" name,
//! plus operator-supplied extras) to the UTF-8 interpretation of the bytes
//! before anything is persisted. Every rule that matched is recorded both in
//! the artifact and in metrics. Previews are hard-truncated so a missed
//! pattern variant cannot leak unbounded content.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::metrics::BrokerMetrics;

/// Greeting capture byte cap.
pub const MAX_GREETING_BYTES: usize = 512;

/// Rolling chunk-capture window size.
pub const FRAME_CHUNK_LIMIT: usize = 25;

/// Per-chunk byte cap.
pub const FRAME_CHUNK_MAX_BYTES: usize = 256;

/// Global chunk-capture byte cap.
pub const FRAME_CAPTURE_TOTAL_CAP: usize = 4096;

/// Redaction preview character budget.
pub const REDACTION_MAX_PREVIEW: usize = 200;

/// Direction of a raw-captured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureDirection {
    Send,
    Recv,
}

impl CaptureDirection {
    fn as_str(&self) -> &'static str {
        match self {
            CaptureDirection::Send => "send",
            CaptureDirection::Recv => "recv",
        }
    }
}

/// One captured inbound chunk.
#[derive(Debug, Clone, Serialize)]
pub struct FrameChunk {
    pub index: u64,
    pub length: usize,
    pub hex: String,
    pub ascii_preview: String,
    pub ts: u64,
    pub truncated: bool,
}

/// Greeting section of a capture snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct GreetingSnapshot {
    pub enabled: bool,
    pub captured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ascii_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// Frame-chunk section of a capture snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct FramesSnapshot {
    pub count: usize,
    pub total_bytes: usize,
    pub dropped: u64,
    pub cap: usize,
    pub chunks: Vec<FrameChunk>,
}

/// Redaction section of a capture snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RedactionConfigSnapshot {
    pub enabled: bool,
    pub rules: Vec<String>,
}

/// Full capture snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSnapshot {
    pub greeting_enabled: bool,
    pub frame_capture_enabled: bool,
    pub greeting: GreetingSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<FramesSnapshot>,
    pub redaction: RedactionConfigSnapshot,
}

struct RedactionRule {
    name: String,
    pattern: regex::Regex,
    replace: &'static str,
}

struct GreetingCapture {
    bytes: Vec<u8>,
    ts: u64,
}

#[derive(Default)]
struct CaptureInner {
    greeting: Option<GreetingCapture>,
    chunks: VecDeque<FrameChunk>,
    total_bytes: usize,
    dropped: u64,
    seq: u64,
    raw_dir_ready: bool,
}

/// Flag-gated capture sink shared by the transport and session layers.
pub struct BrokerCapture {
    greeting_enabled: bool,
    frame_enabled: bool,
    raw_enabled: bool,
    redact_enabled: bool,
    raw_dir: PathBuf,
    rules: Vec<RedactionRule>,
    metrics: Arc<BrokerMetrics>,
    inner: Mutex<CaptureInner>,
}

impl BrokerCapture {
    /// Build a capture sink from the configuration.
    ///
    /// Invalid operator-supplied redaction patterns are skipped with a
    /// warning rather than failing construction.
    pub fn new(config: &BrokerConfig, metrics: Arc<BrokerMetrics>) -> Self {
        let mut rules = vec![
            RedactionRule {
                name: "SSN".to_string(),
                pattern: regex::Regex::new(r"\b\d{3}-?\d{2}-?\d{4}\b")
                    .expect("invalid SSN pattern"),
                replace: "[SSN]",
            },
            RedactionRule {
                name: "DOB".to_string(),
                pattern: regex::Regex::new(
                    r"\b(19|20)\d{2}[-/](0[1-9]|1[0-2])[-/](0[1-9]|[12]\d|3[01])\b",
                )
                .expect("invalid DOB pattern"),
                replace: "[DOB]",
            },
            RedactionRule {
                name: "NAME".to_string(),
                pattern: regex::Regex::new(r"\b([A-Z][a-z]+,\s?[A-Z][a-z]+)\b")
                    .expect("invalid NAME pattern"),
                replace: "[NAME]",
            },
        ];
        for (i, pattern) in config.redact_extra.iter().enumerate() {
            match regex::Regex::new(pattern) {
                Ok(rx) => rules.push(RedactionRule {
                    name: format!("EXTRA_{i}"),
                    pattern: rx,
                    replace: "[REDACT]",
                }),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "ignoring invalid redaction pattern");
                }
            }
        }

        Self {
            greeting_enabled: config.capture_greeting,
            frame_enabled: config.capture_frames,
            raw_enabled: config.capture_raw,
            redact_enabled: config.redact,
            raw_dir: config.capture_dir.clone(),
            rules,
            metrics,
            inner: Mutex::new(CaptureInner::default()),
        }
    }

    fn locked(&self) -> MutexGuard<'_, CaptureInner> {
        self.inner.lock().expect("capture mutex poisoned")
    }

    /// Capture the first inbound buffer (greeting banner), bounded.
    pub fn record_greeting(&self, buf: &[u8]) {
        if !self.greeting_enabled {
            return;
        }
        let mut inner = self.locked();
        if inner.greeting.is_some() {
            return;
        }
        let bounded = &buf[..buf.len().min(MAX_GREETING_BYTES)];
        inner.greeting = Some(GreetingCapture {
            bytes: bounded.to_vec(),
            ts: unix_millis(),
        });
    }

    /// Capture one inbound chunk into the bounded rolling window.
    pub fn record_frame_chunk(&self, buf: &[u8]) {
        if !self.frame_enabled {
            return;
        }
        let mut inner = self.locked();
        if inner.total_bytes >= FRAME_CAPTURE_TOTAL_CAP {
            inner.dropped += 1;
            return;
        }
        let slice = &buf[..buf.len().min(FRAME_CHUNK_MAX_BYTES)];
        let truncated = slice.len() != buf.len();
        let index = inner.seq;
        inner.seq += 1;
        let chunk = FrameChunk {
            index,
            length: slice.len(),
            hex: hex::encode(slice),
            ascii_preview: ascii_preview(slice),
            ts: unix_millis(),
            truncated,
        };
        inner.total_bytes += slice.len();
        inner.chunks.push_back(chunk);
        if inner.chunks.len() > FRAME_CHUNK_LIMIT {
            inner.chunks.pop_front();
        }
    }

    /// Persist an outbound buffer as a redacted raw artifact.
    pub fn record_send(&self, buf: &[u8], meta: serde_json::Value) {
        self.write_raw(CaptureDirection::Send, buf, meta);
    }

    /// Persist an inbound buffer as a redacted raw artifact.
    pub fn record_recv(&self, buf: &[u8], meta: serde_json::Value) {
        self.write_raw(CaptureDirection::Recv, buf, meta);
    }

    fn write_raw(&self, direction: CaptureDirection, buf: &[u8], meta: serde_json::Value) {
        if !self.raw_enabled {
            return;
        }
        if let Err(e) = self.try_write_raw(direction, buf, meta) {
            tracing::debug!(error = %e, "raw capture write failed");
        }
    }

    fn try_write_raw(
        &self,
        direction: CaptureDirection,
        buf: &[u8],
        meta: serde_json::Value,
    ) -> Result<()> {
        let seq = {
            let mut inner = self.locked();
            if !inner.raw_dir_ready {
                std::fs::create_dir_all(&self.raw_dir)?;
                inner.raw_dir_ready = true;
            }
            let seq = inner.seq;
            inner.seq += 1;
            seq
        };

        let (redacted, applied, preview) = self.redact(buf);
        self.metrics.record_redaction(&applied);

        let ts = unix_millis();
        let artifact = json!({
            "ts": ts,
            "direction": direction.as_str(),
            "length": buf.len(),
            "redaction": { "enabled": self.redact_enabled, "applied": applied },
            "hex": hex::encode(&redacted),
            "ascii_preview": preview,
            "meta": meta,
        });

        let name = format!("{ts}-{}-{seq}.json", direction.as_str());
        let body = serde_json::to_vec_pretty(&artifact)?;
        std::fs::write(self.raw_dir.join(name), body)?;
        Ok(())
    }

    /// Apply the redaction rules to a buffer.
    ///
    /// Returns the redacted bytes, the names of every rule that matched,
    /// and a truncated ASCII preview.
    fn redact(&self, buf: &[u8]) -> (Vec<u8>, Vec<String>, String) {
        if !self.redact_enabled {
            return (buf.to_vec(), Vec::new(), ascii_preview(buf));
        }
        let mut text = String::from_utf8_lossy(buf).into_owned();
        let mut applied = Vec::new();
        for rule in &self.rules {
            if rule.pattern.is_match(&text) {
                text = rule.pattern.replace_all(&text, rule.replace).into_owned();
                applied.push(rule.name.clone());
            }
        }
        let preview: String = if text.chars().count() > REDACTION_MAX_PREVIEW {
            let head: String = text.chars().take(REDACTION_MAX_PREVIEW).collect();
            format!("{head}…")
        } else {
            text.clone()
        };
        let preview = preview
            .chars()
            .map(|c| if (' '..='~').contains(&c) { c } else { '.' })
            .collect();
        (text.into_bytes(), applied, preview)
    }

    /// Report capture status without mutating any state.
    pub fn snapshot(&self) -> CaptureSnapshot {
        let inner = self.locked();
        let greeting = match (&inner.greeting, self.greeting_enabled) {
            (_, false) => GreetingSnapshot {
                enabled: false,
                captured: false,
                length: None,
                hex: None,
                ascii_preview: None,
                ts: None,
            },
            (None, true) => GreetingSnapshot {
                enabled: true,
                captured: false,
                length: None,
                hex: None,
                ascii_preview: None,
                ts: None,
            },
            (Some(g), true) => GreetingSnapshot {
                enabled: true,
                captured: true,
                length: Some(g.bytes.len()),
                hex: Some(hex::encode(&g.bytes)),
                ascii_preview: Some(ascii_preview(&g.bytes)),
                ts: Some(g.ts),
            },
        };

        let frames = self.frame_enabled.then(|| FramesSnapshot {
            count: inner.chunks.len(),
            total_bytes: inner.total_bytes,
            dropped: inner.dropped,
            cap: FRAME_CAPTURE_TOTAL_CAP,
            chunks: inner.chunks.iter().cloned().collect(),
        });

        CaptureSnapshot {
            greeting_enabled: self.greeting_enabled,
            frame_capture_enabled: self.frame_enabled,
            greeting,
            frames,
            redaction: RedactionConfigSnapshot {
                enabled: self.redact_enabled,
                rules: self.rules.iter().map(|r| r.name.clone()).collect(),
            },
        }
    }

    /// Clear captured state (configuration is untouched).
    pub fn reset(&self) {
        let mut inner = self.locked();
        *inner = CaptureInner::default();
    }
}

fn ascii_preview(buf: &[u8]) -> String {
    buf.iter()
        .map(|b| {
            if (0x20..=0x7E).contains(b) {
                *b as char
            } else {
                '.'
            }
        })
        .collect()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
