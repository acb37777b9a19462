//! Patient-list response parser.
//!
//! Turns decoded `ORWPT LIST` lines into structured records plus
//! parse-quality statistics. Field order on the wire is
//! `id ^ name ^ icn ^ gender ^ dob ^ ssn`. Callers use the statistics for
//! observability only, never for control flow.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;

/// Field delimiter in patient-list lines.
pub const FIELD_DELIMITER: char = '^';

static DOB_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}/\d{2}/\d{4}$").expect("invalid DOB pattern"));

/// One parsed patient record. Derived purely from parsing; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientRecord {
    /// Internal entry number.
    pub id: String,
    /// Display name (`LAST,FIRST`).
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Integration Control Number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssn: Option<String>,
    /// Last 4 of the SSN, or of the ICN as a proxy when no SSN is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssn_last4: Option<String>,
    /// Normalized to `M`/`F`; omitted otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Original `MM/DD/YYYY` form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    /// ISO `YYYY-MM-DD` form, when the date validated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dob_iso: Option<String>,
    /// Original raw line, for traceability.
    pub raw: String,
}

/// Why a line produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueReason {
    NoDelimiters,
    InsufficientFields,
    MissingCoreFields,
}

impl IssueReason {
    /// Stable string form used as a metrics key.
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueReason::NoDelimiters => "NO_DELIMITERS",
            IssueReason::InsufficientFields => "INSUFFICIENT_FIELDS",
            IssueReason::MissingCoreFields => "MISSING_CORE_FIELDS",
        }
    }
}

/// One unparseable line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseIssue {
    pub line: String,
    pub reason: IssueReason,
    pub index: usize,
}

/// Parse-quality counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub dob_normalized: u64,
    pub dob_invalid: u64,
    pub gender_omitted: u64,
    pub name_split_failed: u64,
    pub dropped_for_strict_dob: u64,
}

/// Parser output: records, issues, and quality statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseOutcome {
    pub patients: Vec<PatientRecord>,
    pub issues: Vec<ParseIssue>,
    pub stats: ParseStats,
}

/// Parse patient-list response lines.
///
/// With `strict_dob` set, records whose DOB failed validation are dropped
/// entirely (and counted) instead of being kept without an ISO date.
///
/// # Example
///
/// ```
/// use xwb_broker::parser::parse_patient_list;
///
/// let lines = vec!["100^DOE,JOHN^1234^M^01/12/1965".to_string()];
/// let outcome = parse_patient_list(&lines, false);
/// assert_eq!(outcome.patients[0].dob_iso.as_deref(), Some("1965-01-12"));
/// assert!(outcome.issues.is_empty());
/// ```
pub fn parse_patient_list(lines: &[String], strict_dob: bool) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();

    for (index, line) in lines.iter().enumerate() {
        if !line.contains(FIELD_DELIMITER) {
            outcome.issues.push(ParseIssue {
                line: line.clone(),
                reason: IssueReason::NoDelimiters,
                index,
            });
            continue;
        }
        let parts: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        if parts.len() < 2 {
            outcome.issues.push(ParseIssue {
                line: line.clone(),
                reason: IssueReason::InsufficientFields,
                index,
            });
            continue;
        }

        let id = parts[0];
        let name = parts[1];
        if id.is_empty() || name.is_empty() {
            outcome.issues.push(ParseIssue {
                line: line.clone(),
                reason: IssueReason::MissingCoreFields,
                index,
            });
            continue;
        }
        let icn = parts.get(2).copied().unwrap_or_default();
        let gender = parts.get(3).copied().unwrap_or_default();
        let dob = parts.get(4).copied().unwrap_or_default();
        let ssn = parts.get(5).copied().unwrap_or_default();

        let mut record = PatientRecord {
            id: id.to_string(),
            name: name.to_string(),
            last_name: None,
            first_name: None,
            icn: None,
            ssn: None,
            ssn_last4: None,
            gender: None,
            dob: None,
            dob_iso: None,
            raw: line.clone(),
        };

        if let Some((last, first)) = name.split_once(',') {
            let last = last.trim();
            let first = first.trim();
            if !last.is_empty() {
                record.last_name = Some(last.to_string());
            }
            if !first.is_empty() {
                record.first_name = Some(first.to_string());
            }
        } else {
            outcome.stats.name_split_failed += 1;
        }

        if !icn.is_empty() {
            record.icn = Some(icn.to_string());
            if icn.len() >= 4 {
                record.ssn_last4 = Some(icn[icn.len() - 4..].to_string());
            }
        }
        if ssn.len() >= 4 {
            record.ssn = Some(ssn.to_string());
            // A genuine SSN overrides the ICN-derived proxy
            record.ssn_last4 = Some(ssn[ssn.len() - 4..].to_string());
        }

        if gender.eq_ignore_ascii_case("M") || gender.eq_ignore_ascii_case("F") {
            record.gender = Some(gender.to_ascii_uppercase());
        } else {
            outcome.stats.gender_omitted += 1;
        }

        let mut dob_valid = true;
        if !dob.is_empty() {
            if DOB_PATTERN.is_match(dob) {
                record.dob = Some(dob.to_string());
                match NaiveDate::parse_from_str(dob, "%m/%d/%Y") {
                    Ok(date) => {
                        record.dob_iso = Some(date.format("%Y-%m-%d").to_string());
                        outcome.stats.dob_normalized += 1;
                    }
                    Err(_) => {
                        outcome.stats.dob_invalid += 1;
                        dob_valid = false;
                    }
                }
            } else {
                outcome.stats.dob_invalid += 1;
                dob_valid = false;
            }
        }

        if strict_dob && !dob_valid {
            outcome.stats.dropped_for_strict_dob += 1;
            continue;
        }
        outcome.patients.push(record);
    }

    outcome
}
