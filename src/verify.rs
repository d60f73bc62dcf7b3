//! Verification gate: six deterministic checks over the drafted memo and the
//! structured artifacts behind it. All checks are pure functions; the LM is
//! never consulted here. Any failure blocks the run and yields a correction
//! plan naming the phase to redo.

use crate::model::{
    Authority, CorrectionItem, PrecedentialStatus, Rule, SourceRef, VerificationOutcome,
};
use crate::phases::normalize_ws;
use regex::Regex;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Everything the gate examines. References only; the gate mutates nothing.
pub struct GateInput<'a> {
    pub draft: &'a str,
    pub locked_jurisdictions: &'a [String],
    pub authorities: &'a [Authority],
    pub rules: &'a [Rule],
    pub sources: &'a [SourceRef],
}

#[derive(Debug)]
pub struct GateReport {
    pub passed: bool,
    pub outcomes: Vec<VerificationOutcome>,
    pub correction_plan: Vec<CorrectionItem>,
}

/// Outcome-prediction phrases the memo must never contain.
const BANNED_PHRASES: &[&str] = &[
    "will win",
    "will succeed",
    "will prevail",
    "likely to win",
    "likely succeed",
    "likely prevail",
    "guaranteed",
    "slam dunk",
    "certain victory",
    "should win",
    "definitely win",
    "will lose",
    "will certainly",
    "will definitely",
    "definitely lose",
    "certain to prevail",
    "certain to succeed",
    "likely to succeed",
];

/// Conditional-language markers; the draft must use at least this many
/// distinct markers.
const CONDITIONAL_MARKERS: &[&str] = &["if", "assuming", "to the extent", "may", "could", "might"];
const MIN_CONDITIONAL_MARKERS: usize = 3;

/// Wording that counts as disclosing adverse authority.
const ADVERSE_SECTION_TERMS: &[&str] = &["adverse authority", "negative treatment"];

type Check = fn(&GateInput) -> (bool, String);

/// Ordered check table. Order is part of the report contract.
const CHECKS: &[(&str, &str, &str, Check)] = &[
    (
        "citation_integrity",
        "Citation Integrity",
        "phase_7_memo_drafting",
        check_citation_integrity,
    ),
    (
        "quote_accuracy",
        "Quote Accuracy",
        "phase_5_rule_extraction",
        check_quote_accuracy,
    ),
    (
        "precedential_status",
        "Precedential Status",
        "phase_3_authority_validation",
        check_precedential_status,
    ),
    (
        "jurisdiction_consistency",
        "Jurisdiction Consistency",
        "phase_7_memo_drafting",
        check_jurisdiction_consistency,
    ),
    (
        "adverse_disclosure",
        "Adverse Authority Disclosure",
        "phase_7_memo_drafting",
        check_adverse_disclosure,
    ),
    (
        "reasoning_structure",
        "Reasoning Structure",
        "phase_7_memo_drafting",
        check_reasoning_structure,
    ),
];

/// Run every check in order. A check that panics counts as failed, with the
/// panic recorded in its details; the remaining checks still run.
pub fn run_gate(input: &GateInput) -> GateReport {
    let mut outcomes = Vec::with_capacity(CHECKS.len());
    let mut correction_plan = Vec::new();
    for (check_id, name, blocked_phase, check) in CHECKS {
        let (passed, details) = match catch_unwind(AssertUnwindSafe(|| check(input))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                (false, format!("check panicked: {msg}"))
            }
        };
        if !passed {
            correction_plan.push(CorrectionItem {
                check: (*check_id).to_string(),
                detail: details.clone(),
                remediation: remediation_for(check_id).to_string(),
            });
        }
        outcomes.push(VerificationOutcome {
            check_id: (*check_id).to_string(),
            name: (*name).to_string(),
            passed,
            details,
            blocked_phase: (!passed).then(|| (*blocked_phase).to_string()),
        });
    }
    GateReport {
        passed: correction_plan.is_empty(),
        outcomes,
        correction_plan,
    }
}

/// Fixed remediation hint per check id.
fn remediation_for(check_id: &str) -> &'static str {
    match check_id {
        "citation_integrity" => {
            "Redraft the memo citing only the bracket numbers of supplied sources"
        }
        "quote_accuracy" => {
            "Re-extract rules so every quoted passage matches its cited source verbatim"
        }
        "precedential_status" => {
            "Add an adverse-authority discussion or drop the negatively treated authority"
        }
        "jurisdiction_consistency" => {
            "Label out-of-jurisdiction authorities as persuasive rather than controlling"
        }
        "adverse_disclosure" => {
            "Add an adverse-authority section disclosing every negative treatment found"
        }
        "reasoning_structure" => {
            "Rewrite predictions as conditional analysis; add conditional language throughout"
        }
        _ => "Review the failing phase output and rerun it",
    }
}

/// Every bracketed citation in the draft must reference a supplied source.
fn check_citation_integrity(input: &GateInput) -> (bool, String) {
    let pattern = Regex::new(r"\[(\d+)\]").expect("citation regex");
    let valid: BTreeSet<usize> = input.sources.iter().map(|s| s.citation_id).collect();
    let mut cited = BTreeSet::new();
    let mut invalid = BTreeSet::new();
    for capture in pattern.captures_iter(input.draft) {
        if let Ok(id) = capture[1].parse::<usize>() {
            cited.insert(id);
            if !valid.contains(&id) {
                invalid.insert(id);
            }
        }
    }
    if !invalid.is_empty() {
        let listing = invalid
            .iter()
            .map(|id| format!("[{id}]"))
            .collect::<Vec<_>>()
            .join(", ");
        return (
            false,
            format!("citations referencing no supplied source: {listing}"),
        );
    }
    (true, format!("{} distinct citations, all resolvable", cited.len()))
}

/// Every extracted rule's quoted text must appear verbatim (modulo
/// whitespace) in the passage its citation points at.
fn check_quote_accuracy(input: &GateInput) -> (bool, String) {
    let mut errors = Vec::new();
    for rule in input.rules {
        let Some(source) = input
            .sources
            .iter()
            .find(|s| s.citation_id == rule.citation_id)
        else {
            errors.push(format!(
                "{} cites [{}] which maps to no source",
                rule.rule_id, rule.citation_id
            ));
            continue;
        };
        if !normalize_ws(&source.text).contains(&normalize_ws(&rule.quoted_text)) {
            errors.push(format!(
                "{} quote not found verbatim in [{}]",
                rule.rule_id, rule.citation_id
            ));
        }
    }
    if errors.is_empty() {
        (true, format!("{} quotes verified", input.rules.len()))
    } else {
        (false, errors.join("; "))
    }
}

fn negatively_treated<'a>(input: &'a GateInput) -> Vec<&'a Authority> {
    input
        .authorities
        .iter()
        .filter(|a| a.precedential_status == PrecedentialStatus::NegativeTreatmentFound)
        .collect()
}

fn has_adverse_section(draft: &str) -> bool {
    let lower = draft.to_lowercase();
    ADVERSE_SECTION_TERMS.iter().any(|t| lower.contains(t))
}

/// An authority with negative treatment may not be relied on as if
/// uncontested: if the draft uses its name, the draft must also carry an
/// adverse-authority discussion.
fn check_precedential_status(input: &GateInput) -> (bool, String) {
    let negative = negatively_treated(input);
    if negative.is_empty() {
        return (true, "no negative treatment among cited authorities".to_string());
    }
    let lower = input.draft.to_lowercase();
    let undisclosed: Vec<&str> = negative
        .iter()
        .filter(|a| lower.contains(&a.name.to_lowercase()) && !has_adverse_section(input.draft))
        .map(|a| a.name.as_str())
        .collect();
    if undisclosed.is_empty() {
        (
            true,
            format!("{} negatively treated authorities handled", negative.len()),
        )
    } else {
        (
            false,
            format!(
                "authorities with negative treatment used without discussion: {}",
                undisclosed.join(", ")
            ),
        )
    }
}

/// Out-of-jurisdiction authorities named in the draft require persuasive
/// labeling somewhere in the memo.
fn check_jurisdiction_consistency(input: &GateInput) -> (bool, String) {
    let lower = input.draft.to_lowercase();
    let outside: Vec<&Authority> = input
        .authorities
        .iter()
        .filter(|a| {
            !a.jurisdiction.trim().is_empty()
                && !input.locked_jurisdictions.contains(&a.jurisdiction)
                && lower.contains(&a.name.to_lowercase())
        })
        .collect();
    if outside.is_empty() {
        return (true, "all cited authorities within locked jurisdictions".to_string());
    }
    if lower.contains("persuasive") {
        (
            true,
            format!("{} out-of-jurisdiction authorities labeled persuasive", outside.len()),
        )
    } else {
        (
            false,
            format!(
                "out-of-jurisdiction authorities cited without persuasive labeling: {}",
                outside
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        )
    }
}

/// If any authority carries negative treatment, the draft must contain an
/// adverse-authority section regardless of whether the name appears.
fn check_adverse_disclosure(input: &GateInput) -> (bool, String) {
    let negative = negatively_treated(input);
    if negative.is_empty() {
        return (true, "no adverse authority to disclose".to_string());
    }
    if has_adverse_section(input.draft) {
        (
            true,
            format!("adverse-authority section present for {} authorities", negative.len()),
        )
    } else {
        (
            false,
            format!(
                "{} authorities with negative treatment but no adverse-authority section",
                negative.len()
            ),
        )
    }
}

/// No outcome predictions, and enough conditional language to show the
/// analysis is qualified rather than speculative.
fn check_reasoning_structure(input: &GateInput) -> (bool, String) {
    let lower = input.draft.to_lowercase();
    let banned: Vec<&str> = BANNED_PHRASES
        .iter()
        .filter(|p| lower.contains(*p))
        .copied()
        .collect();
    if !banned.is_empty() {
        return (
            false,
            format!("outcome-prediction language present: {}", banned.join(", ")),
        );
    }
    let present = CONDITIONAL_MARKERS
        .iter()
        .filter(|marker| {
            if marker.contains(' ') {
                lower.contains(*marker)
            } else {
                let pattern =
                    Regex::new(&format!(r"\b{}\b", regex::escape(marker))).expect("marker regex");
                pattern.is_match(&lower)
            }
        })
        .count();
    if present < MIN_CONDITIONAL_MARKERS {
        return (
            false,
            format!(
                "only {present} of {MIN_CONDITIONAL_MARKERS} required conditional markers present"
            ),
        );
    }
    (true, format!("{present} conditional markers, no banned phrasing"))
}
