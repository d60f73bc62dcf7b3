//! Run & definition data model shared by the engine, executor, and gate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Epoch-millisecond timestamp.
pub fn now_epoch_ms() -> Result<u128> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .map_err(|e| Error::Validation(format!("compute timestamp: {e}")))
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    NeedsInput,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// Status of a single phase within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One phase of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub phase_id: String,
    pub name: String,
    pub ordinal: usize,
    pub verifiable: bool,
    pub requires_human_input: bool,
}

/// An ordered, immutable list of phases. Registered once at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub definition_id: String,
    pub name: String,
    pub description: String,
    pub required_inputs: Vec<String>,
    pub optional_inputs: Vec<String>,
    pub phases: Vec<PhaseSpec>,
}

/// Reference to a retrieved passage as supplied to a phase. `citation_id`
/// is the 1-based bracket number used for citations in the draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub citation_id: usize,
    pub passage_id: String,
    pub document_title: String,
    pub page: Option<u32>,
    pub text: String,
    pub similarity: f32,
}

/// Whether an authority shows evidence of negative judicial treatment in
/// the corpus. Set only by the authority validation phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrecedentialStatus {
    Unknown,
    TreatedAsGoodLawInDocs,
    NegativeTreatmentFound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityKind {
    Statute,
    Rule,
    Regulation,
    Doctrine,
    Case,
}

/// A verbatim quote tied to the passage it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupportingQuote {
    pub quote: String,
    pub citation_id: usize,
}

/// A statute, rule, regulation, doctrine, or case identified as relevant.
/// An authority with zero supporting quotes is never retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authority {
    pub authority_id: String,
    pub kind: AuthorityKind,
    /// Name or caption (e.g. "Smith v. Jones").
    pub name: String,
    pub jurisdiction: String,
    pub supporting_quotes: Vec<SupportingQuote>,
    pub precedential_status: PrecedentialStatus,
    /// Evidence excerpt when negative treatment was found.
    pub treatment_evidence: Option<String>,
}

/// One node of the issue tree. Retained only when mapped to at least one
/// governing authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueNode {
    pub issue_id: String,
    pub element: String,
    pub authority_ids: Vec<String>,
    pub uncertainty: bool,
    pub notes: String,
}

/// A discrete rule statement extracted from an authority's quoted text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub issue_id: String,
    pub authority_id: String,
    pub quoted_text: String,
    pub citation_id: usize,
    pub precedential_status: PrecedentialStatus,
}

/// Conditional application of an issue's rules to the supplied facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleApplication {
    pub issue_id: String,
    pub analysis: String,
    pub gaps: Vec<String>,
    pub uncertainties: Vec<String>,
}

/// Outcome of one verification check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub check_id: String,
    pub name: String,
    pub passed: bool,
    pub details: String,
    pub blocked_phase: Option<String>,
}

/// One entry of a correction plan: a failing check plus its remediation hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionItem {
    pub check: String,
    pub detail: String,
    pub remediation: String,
}

/// Per-phase artifacts, one variant per phase. A later phase reads, never
/// mutates, an earlier phase's variant; malformed cross-phase access fails
/// at the match instead of at generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseArtifacts {
    Intake {
        locked_question: String,
        locked_jurisdictions: Vec<String>,
        court_level: String,
        posture: String,
        assumptions: Vec<String>,
        memo_format: String,
    },
    AuthorityGrounding {
        candidates: Vec<Authority>,
    },
    CaseRetrieval {
        cases: Vec<Authority>,
    },
    AuthorityValidation {
        authorities: Vec<Authority>,
    },
    IssueDecomposition {
        issue_tree: Vec<IssueNode>,
    },
    RuleExtraction {
        rules: Vec<Rule>,
    },
    RuleApplication {
        applications: Vec<RuleApplication>,
    },
    Drafting {
        memo: String,
    },
    Verification {
        passed: bool,
        outcomes: Vec<VerificationOutcome>,
    },
    Export {
        memo: String,
        authority_table: Vec<Authority>,
        issue_tree: Vec<IssueNode>,
        outcomes: Vec<VerificationOutcome>,
        /// Sources actually cited in the memo, ascending by citation id.
        /// A list rather than an integer-keyed map: internally tagged enums
        /// buffer their content, and that path loses non-string map keys.
        citation_map: Vec<SourceRef>,
    },
    /// Artifacts resolved by an external human actor for a human-input phase.
    HumanInput {
        notes: Vec<String>,
    },
}

/// Result slot for one phase of a run, pre-allocated at run creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub artifacts: Option<PhaseArtifacts>,
    /// Passage ids actually used by the phase.
    pub sources: Vec<SourceRef>,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    pub started_at: Option<u128>,
    pub finished_at: Option<u128>,
}

impl PhaseResult {
    pub fn pending(phase_id: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            status: PhaseStatus::Pending,
            artifacts: None,
            sources: Vec::new(),
            logs: Vec::new(),
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub definition_id: String,
    /// Opaque owner reference (e.g. a matter id).
    pub owner: String,
    pub status: WorkflowStatus,
    pub current_phase: usize,
    pub inputs: BTreeMap<String, String>,
    pub phase_results: Vec<PhaseResult>,
    pub created_at: u128,
    pub finished_at: Option<u128>,
    pub error_message: Option<String>,
    pub correction_plan: Option<Vec<CorrectionItem>>,
}

impl WorkflowRun {
    /// Apply a status transition, enforcing the monotone graph
    /// `Pending -> Running -> {NeedsInput -> Running}* -> {Completed|Failed}`.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        use WorkflowStatus::*;
        let ok = match (self.status, next) {
            (Pending, Running) => true,
            (Running, NeedsInput) | (NeedsInput, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Pending, Failed) => true,
            _ => false,
        };
        if !ok {
            return Err(Error::Validation(format!(
                "illegal status transition: {:?} -> {next:?} for run {}",
                self.status, self.run_id
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(now_epoch_ms()?);
        }
        Ok(())
    }

    /// Artifacts of an earlier, completed phase.
    pub fn artifacts_of(&self, phase_index: usize) -> Option<&PhaseArtifacts> {
        self.phase_results
            .get(phase_index)
            .and_then(|r| r.artifacts.as_ref())
    }

    /// All provenance references accumulated by retrieval phases so far.
    pub fn accumulated_sources(&self) -> Vec<SourceRef> {
        let mut all = Vec::new();
        for result in &self.phase_results {
            all.extend(result.sources.iter().cloned());
        }
        all
    }
}
