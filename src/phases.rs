//! Domain phase handlers for the litigation research memo workflow.
//!
//! Every handler is a function over the run's locked inputs, the read-only
//! artifacts of earlier phases, and the two external capabilities
//! (retrieve, generate). Handlers never touch run status; the executor owns
//! all bookkeeping. A handler error fails the phase, and the run.

use crate::error::{Error, Result};
use crate::lm::{strip_code_fences, Generator};
use crate::model::{
    Authority, AuthorityKind, IssueNode, PhaseArtifacts, PhaseSpec, PrecedentialStatus, Rule,
    RuleApplication, SourceRef, SupportingQuote, WorkflowDefinition, WorkflowRun,
};
use crate::store::Retriever;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Passages retrieved per grounding/case query.
const RETRIEVAL_TOP_K: usize = 10;
/// Passages examined per authority during negative-treatment validation.
const VALIDATION_TOP_K: usize = 5;
/// Gap threshold above which rule application logs a warning.
const GAP_WARNING_THRESHOLD: usize = 5;
/// Output budget for drafting, in characters.
const DRAFT_MAX_CHARS: usize = 60_000;
/// Output budget for structured (JSON) responses.
const STRUCTURED_MAX_CHARS: usize = 20_000;

/// Negative-treatment signal vocabulary. Matching is a substring heuristic
/// over retrieved passages; its precision is a known weak point, revisit
/// with care (see DESIGN.md).
pub const NEGATIVE_TREATMENT_SIGNALS: &[&str] = &[
    "overruled",
    "abrogated",
    "superseded",
    "distinguished",
    "limited",
    "vacated",
    "reversed",
    "criticized",
];

/// Vocabulary suggesting a passage discusses a judicial opinion.
const CASE_INDICATOR_TERMS: &[&str] = &["court", "held", "opinion", "judge", "justice"];

/// What a completed phase hands back to the executor.
#[derive(Debug)]
pub struct PhaseOutcome {
    pub artifacts: PhaseArtifacts,
    pub sources: Vec<SourceRef>,
    pub logs: Vec<String>,
}

/// The built-in verifiability-first litigation research memo workflow.
pub fn litigation_memo_definition() -> WorkflowDefinition {
    let phase = |ordinal, phase_id: &str, name: &str, verifiable, human| PhaseSpec {
        phase_id: phase_id.to_string(),
        name: name.to_string(),
        ordinal,
        verifiable,
        requires_human_input: human,
    };
    WorkflowDefinition {
        definition_id: "litigation_research_memo_v1".to_string(),
        name: "Verifiability-First Litigation Research Memo".to_string(),
        description: "Multi-phase workflow producing citation-grounded legal research memos"
            .to_string(),
        required_inputs: vec![
            "research_question".to_string(),
            "jurisdictions".to_string(),
            "court_level".to_string(),
            "matter_posture".to_string(),
        ],
        optional_inputs: vec!["known_facts".to_string(), "memo_format".to_string()],
        phases: vec![
            phase(0, "phase_0_intake", "Human Intake & Framing", false, true),
            phase(1, "phase_1_authority_grounding", "Authority Grounding", true, false),
            phase(2, "phase_2_case_retrieval", "Case Law Retrieval", true, false),
            phase(3, "phase_3_authority_validation", "Authority Validation", true, false),
            phase(4, "phase_4_issue_decomposition", "Issue Decomposition", true, false),
            phase(5, "phase_5_rule_extraction", "Rule Extraction", true, false),
            phase(6, "phase_6_rule_application", "Rule Application to Facts", false, false),
            phase(7, "phase_7_memo_drafting", "Memo Drafting", false, false),
            phase(8, "phase_8_verification", "Verification Gate", true, false),
            phase(9, "phase_9_human_review", "Human Review & Judgment", false, true),
            phase(10, "phase_10_export", "Export & Audit Bundle", false, false),
        ],
    }
}

/// Collapse all whitespace runs to single spaces.
pub fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lock the run's input parameters into the intake artifact. Called when an
/// external actor resolves the intake phase.
pub fn lock_intake(inputs: &BTreeMap<String, String>) -> Result<PhaseArtifacts> {
    let require = |key: &str| -> Result<String> {
        inputs
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Validation(format!("missing required input: {key}")))
    };
    let question = require("research_question")?;
    let jurisdictions: Vec<String> = require("jurisdictions")?
        .split(',')
        .map(|j| j.trim().to_string())
        .filter(|j| !j.is_empty())
        .collect();
    let assumptions: Vec<String> = match inputs.get("known_facts") {
        Some(facts) if !facts.trim().is_empty() => facts
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        _ => vec!["Factual record to be developed".to_string()],
    };
    Ok(PhaseArtifacts::Intake {
        locked_question: question,
        locked_jurisdictions: jurisdictions,
        court_level: require("court_level")?,
        posture: require("matter_posture")?,
        assumptions,
        memo_format: inputs
            .get("memo_format")
            .cloned()
            .unwrap_or_else(|| "IRAC".to_string()),
    })
}

/// The locked intake artifact, or a fail-fast error naming the gap.
fn intake_of(run: &WorkflowRun) -> Result<(&str, &[String], &[String], &str)> {
    match run.artifacts_of(0) {
        Some(PhaseArtifacts::Intake {
            locked_question,
            locked_jurisdictions,
            assumptions,
            memo_format,
            ..
        }) => Ok((
            locked_question,
            locked_jurisdictions,
            assumptions,
            memo_format,
        )),
        _ => Err(Error::Validation(
            "intake artifacts missing; phase 0 has not completed".to_string(),
        )),
    }
}

fn grounding_of(run: &WorkflowRun) -> Result<&[Authority]> {
    match run.artifacts_of(1) {
        Some(PhaseArtifacts::AuthorityGrounding { candidates }) => Ok(candidates),
        _ => Err(Error::Validation(
            "authority grounding artifacts missing".to_string(),
        )),
    }
}

fn cases_of(run: &WorkflowRun) -> Result<&[Authority]> {
    match run.artifacts_of(2) {
        Some(PhaseArtifacts::CaseRetrieval { cases }) => Ok(cases),
        _ => Err(Error::Validation("case retrieval artifacts missing".to_string())),
    }
}

fn validated_of(run: &WorkflowRun) -> Result<&[Authority]> {
    match run.artifacts_of(3) {
        Some(PhaseArtifacts::AuthorityValidation { authorities }) => Ok(authorities),
        _ => Err(Error::Validation(
            "authority validation artifacts missing".to_string(),
        )),
    }
}

fn issues_of(run: &WorkflowRun) -> Result<&[IssueNode]> {
    match run.artifacts_of(4) {
        Some(PhaseArtifacts::IssueDecomposition { issue_tree }) => Ok(issue_tree),
        _ => Err(Error::Validation(
            "issue decomposition artifacts missing".to_string(),
        )),
    }
}

pub(crate) fn rules_of(run: &WorkflowRun) -> Result<&[Rule]> {
    match run.artifacts_of(5) {
        Some(PhaseArtifacts::RuleExtraction { rules }) => Ok(rules),
        _ => Err(Error::Validation("rule extraction artifacts missing".to_string())),
    }
}

fn applications_of(run: &WorkflowRun) -> Result<&[RuleApplication]> {
    match run.artifacts_of(6) {
        Some(PhaseArtifacts::RuleApplication { applications }) => Ok(applications),
        _ => Err(Error::Validation("rule application artifacts missing".to_string())),
    }
}

pub(crate) fn draft_of(run: &WorkflowRun) -> Result<&str> {
    match run.artifacts_of(7) {
        Some(PhaseArtifacts::Drafting { memo }) => Ok(memo),
        _ => Err(Error::Validation("drafting artifacts missing".to_string())),
    }
}

/// Parse a JSON object out of an LM response, tolerating code fences and
/// leading prose.
fn parse_json_response<T: DeserializeOwned>(text: &str, context: &str) -> Result<T> {
    let cleaned = strip_code_fences(text);
    match serde_json::from_str(cleaned) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            // Fall back to the first brace-delimited object in the text.
            if let Some(start) = cleaned.find('{') {
                let mut de = serde_json::Deserializer::from_str(&cleaned[start..]);
                if let Ok(value) = T::deserialize(&mut de) {
                    return Ok(value);
                }
            }
            let preview: String = cleaned.chars().take(200).collect();
            Err(Error::ExternalCapability(format!(
                "{context}: unparseable response ({first_err}); starts with: {preview}"
            )))
        }
    }
}

fn format_sources(sources: &[SourceRef]) -> String {
    sources
        .iter()
        .map(|s| {
            let page = s
                .page
                .map(|p| format!(" (page {p})"))
                .unwrap_or_default();
            format!("[{}] {}{}\n{}\n", s.citation_id, s.document_title, page, s.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn sources_from_hits(
    hits: &[crate::store::SimilarityHit],
    first_citation_id: usize,
) -> Vec<SourceRef> {
    hits.iter()
        .enumerate()
        .map(|(i, h)| SourceRef {
            citation_id: first_citation_id + i,
            passage_id: h.passage_id.clone(),
            document_title: h.document_title.clone(),
            page: h.page,
            text: h.text.clone(),
            similarity: h.similarity,
        })
        .collect()
}

#[derive(Deserialize)]
struct GroundingResponse {
    #[serde(default)]
    authorities: Vec<GroundingCandidate>,
}

#[derive(Deserialize)]
struct GroundingCandidate {
    #[serde(default)]
    kind: Option<AuthorityKind>,
    name: String,
    #[serde(default)]
    jurisdiction: Option<String>,
    #[serde(default)]
    quotes: Vec<QuoteRef>,
}

#[derive(Deserialize)]
struct QuoteRef {
    quote: String,
    citation_id: usize,
}

/// Phase 1: retrieve authority-flavored passages and ask the generator to
/// identify statutes, rules, regulations, and doctrines with verbatim
/// supporting quotes. Candidates without at least one quote that verifiably
/// appears in its cited passage are discarded; zero survivors fail the phase.
pub fn authority_grounding(
    run: &WorkflowRun,
    retriever: &dyn Retriever,
    generator: &dyn Generator,
) -> Result<PhaseOutcome> {
    let (question, jurisdictions, _, _) = intake_of(run)?;
    let query = format!("{question} statute rule doctrine law {}", jurisdictions.join(" "));
    let hits = retriever.search(&query, RETRIEVAL_TOP_K)?;
    if hits.is_empty() {
        return Err(Error::RetrievalEmpty(
            "no relevant authorities found".to_string(),
        ));
    }
    let sources = sources_from_hits(&hits, run.accumulated_sources().len() + 1);

    let prompt = format!(
        "You are analyzing legal documents to identify authorities relevant to a research question.\n\n\
         Research question: {question}\n\
         Jurisdictions: {}\n\n\
         Retrieved sources:\n{}\n\
         Identify statutes, rules, regulations, and legal doctrines relevant to the question.\n\
         Every authority MUST carry at least one verbatim supporting quote copied exactly from a\n\
         source above, with that source's bracket number as citation_id. Omit any authority you\n\
         cannot quote.\n\n\
         Respond with only a JSON object:\n\
         {{\"authorities\": [{{\"kind\": \"statute|rule|regulation|doctrine\", \"name\": \"...\",\n\
         \"jurisdiction\": \"...\", \"quotes\": [{{\"quote\": \"...\", \"citation_id\": 1}}]}}]}}",
        jurisdictions.join(", "),
        format_sources(&sources),
    );
    let response = generator.generate(&prompt, STRUCTURED_MAX_CHARS)?;
    let parsed: GroundingResponse = parse_json_response(&response, "authority grounding")?;

    let default_jurisdiction = jurisdictions.first().cloned().unwrap_or_default();
    let mut candidates = Vec::new();
    let mut logs = Vec::new();
    for candidate in parsed.authorities {
        let quotes = verified_quotes(&candidate.quotes, &sources);
        if quotes.is_empty() {
            logs.push(format!(
                "dropped candidate without verifiable quote: {}",
                candidate.name
            ));
            continue;
        }
        candidates.push(Authority {
            authority_id: format!("auth_{}", candidates.len() + 1),
            kind: candidate.kind.unwrap_or(AuthorityKind::Doctrine),
            name: candidate.name,
            jurisdiction: candidate
                .jurisdiction
                .filter(|j| !j.trim().is_empty())
                .unwrap_or_else(|| default_jurisdiction.clone()),
            supporting_quotes: quotes,
            precedential_status: PrecedentialStatus::Unknown,
            treatment_evidence: None,
        });
    }
    if candidates.is_empty() {
        return Err(Error::RetrievalEmpty(
            "no statutory or doctrinal authorities extracted".to_string(),
        ));
    }
    logs.push(format!("found {} authority candidates", candidates.len()));
    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::AuthorityGrounding { candidates },
        sources,
        logs,
    })
}

/// Keep only quotes whose whitespace-normalized text appears verbatim in
/// the passage their citation_id points at.
fn verified_quotes(quotes: &[QuoteRef], sources: &[SourceRef]) -> Vec<SupportingQuote> {
    quotes
        .iter()
        .filter_map(|q| {
            let source = sources.iter().find(|s| s.citation_id == q.citation_id)?;
            let quote = normalize_ws(&q.quote);
            if quote.is_empty() || !normalize_ws(&source.text).contains(&quote) {
                return None;
            }
            Some(SupportingQuote {
                quote,
                citation_id: q.citation_id,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct CaseResponse {
    #[serde(default)]
    cases: Vec<CaseCandidate>,
}

#[derive(Deserialize)]
struct CaseCandidate {
    caption: String,
    #[serde(default)]
    jurisdiction: Option<String>,
    #[serde(default)]
    quotes: Vec<QuoteRef>,
}

/// Phase 2: a second retrieval pass flavored for judicial opinions. Finding
/// no cases is not a failure; the run proceeds on statutory analysis alone.
pub fn case_retrieval(
    run: &WorkflowRun,
    retriever: &dyn Retriever,
    generator: &dyn Generator,
) -> Result<PhaseOutcome> {
    let (question, jurisdictions, _, _) = intake_of(run)?;
    let query = format!("{question} court opinion case holding");
    let hits = retriever.search(&query, RETRIEVAL_TOP_K)?;

    let case_like: Vec<crate::store::SimilarityHit> = hits
        .into_iter()
        .filter(|h| {
            let lower = h.text.to_lowercase();
            h.text.contains(" v. ")
                || CASE_INDICATOR_TERMS.iter().any(|t| lower.contains(t))
        })
        .collect();
    if case_like.is_empty() {
        return Ok(PhaseOutcome {
            artifacts: PhaseArtifacts::CaseRetrieval { cases: Vec::new() },
            sources: Vec::new(),
            logs: vec![
                "no case law found in provided documents; proceeding on statutory analysis"
                    .to_string(),
            ],
        });
    }
    let sources = sources_from_hits(&case_like, run.accumulated_sources().len() + 1);

    let prompt = format!(
        "You are analyzing legal documents to find judicial opinions relevant to a research question.\n\n\
         Research question: {question}\n\n\
         Retrieved sources:\n{}\n\
         Identify court cases or opinions. Every case MUST carry at least one verbatim quote\n\
         copied exactly from a source above, with that source's bracket number as citation_id.\n\
         Omit anything that is not a judicial opinion.\n\n\
         Respond with only a JSON object:\n\
         {{\"cases\": [{{\"caption\": \"Smith v. Jones\", \"jurisdiction\": \"...\",\n\
         \"quotes\": [{{\"quote\": \"...\", \"citation_id\": 1}}]}}]}}",
        format_sources(&sources),
    );
    let response = generator.generate(&prompt, STRUCTURED_MAX_CHARS)?;
    let parsed: CaseResponse = parse_json_response(&response, "case retrieval")?;

    let default_jurisdiction = jurisdictions.first().cloned().unwrap_or_default();
    let mut cases = Vec::new();
    let mut logs = Vec::new();
    for candidate in parsed.cases {
        let quotes = verified_quotes(&candidate.quotes, &sources);
        if quotes.is_empty() {
            logs.push(format!(
                "dropped case without verifiable quote: {}",
                candidate.caption
            ));
            continue;
        }
        cases.push(Authority {
            authority_id: format!("case_{}", cases.len() + 1),
            kind: AuthorityKind::Case,
            name: candidate.caption,
            jurisdiction: candidate
                .jurisdiction
                .filter(|j| !j.trim().is_empty())
                .unwrap_or_else(|| default_jurisdiction.clone()),
            supporting_quotes: quotes,
            precedential_status: PrecedentialStatus::Unknown,
            treatment_evidence: None,
        });
    }
    logs.push(format!("retrieved {} cases from documents", cases.len()));
    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::CaseRetrieval { cases },
        sources,
        logs,
    })
}

/// Phase 3: for each candidate, retrieve passages matching its name plus the
/// negative-treatment vocabulary; a passage containing both the name and a
/// signal word marks the authority negative, with the passage as evidence.
/// Otherwise a candidate with any supporting citation is treated as good law
/// in the provided documents. Pure keyword heuristic.
pub fn authority_validation(
    run: &WorkflowRun,
    retriever: &dyn Retriever,
) -> Result<PhaseOutcome> {
    let mut authorities: Vec<Authority> = grounding_of(run)?.to_vec();
    authorities.extend(cases_of(run)?.iter().cloned());

    let mut negative_count = 0;
    for authority in &mut authorities {
        let query = format!(
            "{} {}",
            authority.name,
            NEGATIVE_TREATMENT_SIGNALS.join(" ")
        );
        let hits = retriever.search(&query, VALIDATION_TOP_K)?;
        let name_lower = authority.name.to_lowercase();
        let negative = hits.iter().find_map(|hit| {
            let text_lower = hit.text.to_lowercase();
            if !text_lower.contains(&name_lower) {
                return None;
            }
            NEGATIVE_TREATMENT_SIGNALS
                .iter()
                .find(|signal| text_lower.contains(*signal))
                .map(|signal| (*signal, hit.text.clone()))
        });
        match negative {
            Some((signal, evidence)) => {
                authority.precedential_status = PrecedentialStatus::NegativeTreatmentFound;
                let mut excerpt = normalize_ws(&evidence);
                if excerpt.len() > 200 {
                    let mut cut = 200;
                    while !excerpt.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    excerpt.truncate(cut);
                }
                authority.treatment_evidence = Some(format!("{signal}: {excerpt}"));
                negative_count += 1;
            }
            None if !authority.supporting_quotes.is_empty() => {
                authority.precedential_status = PrecedentialStatus::TreatedAsGoodLawInDocs;
            }
            None => {}
        }
    }

    let logs = vec![format!(
        "validated {} authorities; {negative_count} with negative treatment",
        authorities.len()
    )];
    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::AuthorityValidation { authorities },
        sources: Vec::new(),
        logs,
    })
}

#[derive(Deserialize)]
struct IssueResponse {
    #[serde(default)]
    issues: Vec<IssueCandidate>,
}

#[derive(Deserialize)]
struct IssueCandidate {
    element: String,
    #[serde(default)]
    authority_ids: Vec<String>,
    #[serde(default)]
    uncertainty: bool,
    #[serde(default)]
    notes: String,
}

/// Phase 4: decompose the question into elements, each mapped to at least
/// one validated authority. Issues failing the mapping requirement are
/// dropped; an empty tree fails the phase.
pub fn issue_decomposition(
    run: &WorkflowRun,
    generator: &dyn Generator,
) -> Result<PhaseOutcome> {
    let (question, _, _, _) = intake_of(run)?;
    let authorities = validated_of(run)?;
    let listing = authorities
        .iter()
        .map(|a| format!("- {}: {} ({:?})", a.authority_id, a.name, a.kind))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Decompose this legal research question into a structured issue tree.\n\n\
         Question: {question}\n\n\
         Available authorities (use these ids):\n{listing}\n\n\
         Each issue is one element that must be established, mapped to the governing\n\
         authorities by id. Flag uncertainty where the documents leave gaps. Do not invent\n\
         authority ids.\n\n\
         Respond with only a JSON object:\n\
         {{\"issues\": [{{\"element\": \"...\", \"authority_ids\": [\"auth_1\"],\n\
         \"uncertainty\": false, \"notes\": \"...\"}}]}}"
    );
    let response = generator.generate(&prompt, STRUCTURED_MAX_CHARS)?;
    let parsed: IssueResponse = parse_json_response(&response, "issue decomposition")?;

    let mut issue_tree = Vec::new();
    let mut logs = Vec::new();
    for candidate in parsed.issues {
        let mapped: Vec<String> = candidate
            .authority_ids
            .into_iter()
            .filter(|id| authorities.iter().any(|a| &a.authority_id == id))
            .collect();
        if mapped.is_empty() {
            logs.push(format!(
                "dropped issue without governing authority: {}",
                candidate.element
            ));
            continue;
        }
        issue_tree.push(IssueNode {
            issue_id: format!("issue_{}", issue_tree.len() + 1),
            element: candidate.element,
            authority_ids: mapped,
            uncertainty: candidate.uncertainty,
            notes: candidate.notes,
        });
    }
    if issue_tree.is_empty() {
        return Err(Error::RetrievalEmpty(
            "no issues could be mapped to document-grounded authorities".to_string(),
        ));
    }
    logs.push(format!("built issue tree with {} issues", issue_tree.len()));
    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::IssueDecomposition { issue_tree },
        sources: Vec::new(),
        logs,
    })
}

/// Phase 5: gather each issue's mapped authorities' verbatim quotes into
/// discrete rule statements. Pure bookkeeping; no external calls.
pub fn rule_extraction(run: &WorkflowRun) -> Result<PhaseOutcome> {
    let issues = issues_of(run)?;
    let authorities = validated_of(run)?;

    let mut rules = Vec::new();
    for issue in issues {
        for authority_id in &issue.authority_ids {
            let Some(authority) = authorities.iter().find(|a| &a.authority_id == authority_id)
            else {
                continue;
            };
            for quote in &authority.supporting_quotes {
                rules.push(Rule {
                    rule_id: format!("rule_{}", rules.len() + 1),
                    issue_id: issue.issue_id.clone(),
                    authority_id: authority.authority_id.clone(),
                    quoted_text: quote.quote.clone(),
                    citation_id: quote.citation_id,
                    precedential_status: authority.precedential_status,
                });
            }
        }
    }
    let logs = vec![format!("extracted {} rules with quoted text", rules.len())];
    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::RuleExtraction { rules },
        sources: Vec::new(),
        logs,
    })
}

#[derive(Deserialize)]
struct ApplicationResponse {
    analysis: String,
    #[serde(default)]
    gaps: Vec<String>,
    #[serde(default)]
    uncertainties: Vec<String>,
}

/// Phase 6: apply each issue's rules to the supplied facts using
/// conditional phrasing, recording gaps and uncertainties. Never predicts
/// outcomes.
pub fn rule_application(
    run: &WorkflowRun,
    generator: &dyn Generator,
) -> Result<PhaseOutcome> {
    let (_, _, assumptions, _) = intake_of(run)?;
    let issues = issues_of(run)?;
    let rules = rules_of(run)?;

    let facts = assumptions
        .iter()
        .map(|a| format!("- {a}"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut applications = Vec::new();
    for issue in issues {
        let issue_rules: Vec<&Rule> = rules.iter().filter(|r| r.issue_id == issue.issue_id).collect();
        if issue_rules.is_empty() {
            continue;
        }
        let rule_text = issue_rules
            .iter()
            .map(|r| format!("- \"{}\" [{}]", r.quoted_text, r.citation_id))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Apply these legal rules to the facts below using strictly conditional language\n\
             (\"if\", \"assuming\", \"to the extent\", \"may\", \"could\"). Identify missing facts\n\
             and unresolved uncertainties. Do NOT predict outcomes; never write \"will win\" or\n\
             \"likely to succeed\".\n\n\
             Issue: {}\n\nRules:\n{rule_text}\n\nFacts:\n{facts}\n\n\
             Respond with only a JSON object:\n\
             {{\"analysis\": \"...\", \"gaps\": [\"...\"], \"uncertainties\": [\"...\"]}}",
            issue.element
        );
        let response = generator.generate(&prompt, STRUCTURED_MAX_CHARS)?;
        let parsed: ApplicationResponse = parse_json_response(&response, "rule application")?;
        applications.push(RuleApplication {
            issue_id: issue.issue_id.clone(),
            analysis: parsed.analysis,
            gaps: parsed.gaps,
            uncertainties: parsed.uncertainties,
        });
    }

    let total_gaps: usize = applications
        .iter()
        .map(|a| a.gaps.len() + a.uncertainties.len())
        .sum();
    let mut logs = vec![format!(
        "applied rules to facts across {} issues; {total_gaps} gaps identified",
        applications.len()
    )];
    if total_gaps > GAP_WARNING_THRESHOLD {
        logs.push(format!(
            "warning: {total_gaps} gaps/uncertainties identified; more facts may be needed before drafting"
        ));
    }
    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::RuleApplication { applications },
        sources: Vec::new(),
        logs,
    })
}

/// Phase 7: compose all prior artifacts into the memo under the instruction
/// contract: per-claim bracket citations restricted to supplied sources,
/// conditional language, and a mandatory adverse-authority section whenever
/// any validated authority carries negative treatment.
pub fn drafting(run: &WorkflowRun, generator: &dyn Generator) -> Result<PhaseOutcome> {
    let (question, jurisdictions, _, memo_format) = intake_of(run)?;
    let authorities = validated_of(run)?;
    let issues = issues_of(run)?;
    let rules = rules_of(run)?;
    let applications = applications_of(run)?;
    let sources = run.accumulated_sources();

    let adverse: Vec<&Authority> = authorities
        .iter()
        .filter(|a| a.precedential_status == PrecedentialStatus::NegativeTreatmentFound)
        .collect();

    let source_listing = sources
        .iter()
        .map(|s| {
            let page = s.page.map(|p| format!(" - page {p}")).unwrap_or_default();
            format!("[{}] {}{}", s.citation_id, s.document_title, page)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let rule_listing = rules
        .iter()
        .map(|r| format!("- \"{}\" [{}]", r.quoted_text, r.citation_id))
        .collect::<Vec<_>>()
        .join("\n");
    let analysis_listing = applications
        .iter()
        .map(|app| {
            let element = issues
                .iter()
                .find(|i| i.issue_id == app.issue_id)
                .map(|i| i.element.as_str())
                .unwrap_or("unknown issue");
            let gaps = if app.gaps.is_empty() {
                "none identified".to_string()
            } else {
                app.gaps.join("; ")
            };
            format!("Issue: {element}\nAnalysis: {}\nGaps: {gaps}", app.analysis)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let adverse_instruction = if adverse.is_empty() {
        String::new()
    } else {
        format!(
            "MANDATORY: include an \"Adverse Authority\" section discussing these authorities\n\
             with negative treatment, by name: {}.\n",
            adverse
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    let persuasive_instruction = {
        let out: Vec<&Authority> = authorities
            .iter()
            .filter(|a| !jurisdictions.contains(&a.jurisdiction))
            .collect();
        if out.is_empty() {
            String::new()
        } else {
            format!(
                "Label these out-of-jurisdiction authorities as persuasive, not controlling: {}.\n",
                out.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(", ")
            )
        }
    };

    let prompt = format!(
        "Draft a legal research memorandum in {memo_format} format.\n\n\
         QUESTION PRESENTED\n{question}\n\n\
         JURISDICTION\n{}\n\n\
         GOVERNING RULES (with citations)\n{rule_listing}\n\n\
         ANALYSIS INPUTS\n{analysis_listing}\n\n\
         AVAILABLE SOURCES (the only permitted citations)\n{source_listing}\n\n\
         Requirements:\n\
         1. Sections: Question Presented; Short Answer (qualified, conditional);\n\
            Background Law; Analysis (issue by issue); Open Questions.\n\
         2. Every legal claim must cite a source as [n], using ONLY the bracket numbers above.\n\
         3. Use conditional language (\"if\", \"assuming\", \"to the extent\", \"may\", \"could\").\n\
            Never predict outcomes; never write \"will win\", \"likely to succeed\", or similar.\n\
         {adverse_instruction}{persuasive_instruction}\n\
         Draft the complete memorandum now.",
        jurisdictions.join(", "),
    );
    let memo = generator.generate(&prompt, DRAFT_MAX_CHARS)?;
    if normalize_ws(&memo).is_empty() {
        return Err(Error::ExternalCapability(
            "drafting returned an empty memorandum".to_string(),
        ));
    }
    let logs = vec![format!("drafted memorandum ({} characters)", memo.len())];
    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::Drafting { memo },
        sources: Vec::new(),
        logs,
    })
}

/// Phase 10: assemble the final bundle from the completed run's artifacts.
pub fn export_assembly(run: &WorkflowRun) -> Result<PhaseOutcome> {
    let memo = draft_of(run)?.to_string();
    let authorities = validated_of(run)?.to_vec();
    let issue_tree = issues_of(run)?.to_vec();
    let outcomes = match run.artifacts_of(8) {
        Some(PhaseArtifacts::Verification { outcomes, .. }) => outcomes.clone(),
        _ => {
            return Err(Error::Validation(
                "verification artifacts missing".to_string(),
            ))
        }
    };
    let sources = run.accumulated_sources();
    let citation_map = citation_map(&memo, &sources);

    Ok(PhaseOutcome {
        artifacts: PhaseArtifacts::Export {
            memo,
            authority_table: authorities,
            issue_tree,
            outcomes,
            citation_map,
        },
        sources: Vec::new(),
        logs: vec!["export artifacts prepared".to_string()],
    })
}

/// Map each bracketed citation appearing in the draft to its source,
/// ascending by citation id.
pub fn citation_map(memo: &str, sources: &[SourceRef]) -> Vec<SourceRef> {
    let pattern = regex::Regex::new(r"\[(\d+)\]").expect("citation regex");
    let mut cited = BTreeSet::new();
    for capture in pattern.captures_iter(memo) {
        if let Ok(id) = capture[1].parse::<usize>() {
            cited.insert(id);
        }
    }
    cited
        .into_iter()
        .filter_map(|id| sources.iter().find(|s| s.citation_id == id).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_orders_phases_by_ordinal() {
        let definition = litigation_memo_definition();
        assert_eq!(definition.phases.len(), 11);
        for (i, phase) in definition.phases.iter().enumerate() {
            assert_eq!(phase.ordinal, i);
        }
        assert!(definition.phases[0].requires_human_input);
        assert!(definition.phases[9].requires_human_input);
        assert!(definition.phases[8].verifiable);
    }

    #[test]
    fn lock_intake_splits_jurisdictions_and_defaults_facts() {
        let inputs = BTreeMap::from([
            ("research_question".to_string(), "What?".to_string()),
            ("jurisdictions".to_string(), "California, Nevada".to_string()),
            ("court_level".to_string(), "trial".to_string()),
            ("matter_posture".to_string(), "MTD".to_string()),
        ]);
        match lock_intake(&inputs).unwrap() {
            PhaseArtifacts::Intake {
                locked_jurisdictions,
                assumptions,
                memo_format,
                ..
            } => {
                assert_eq!(locked_jurisdictions, vec!["California", "Nevada"]);
                assert_eq!(assumptions, vec!["Factual record to be developed"]);
                assert_eq!(memo_format, "IRAC");
            }
            other => panic!("unexpected artifacts: {other:?}"),
        }
    }

    #[test]
    fn lock_intake_rejects_blank_required_fields() {
        let inputs = BTreeMap::from([
            ("research_question".to_string(), "  ".to_string()),
            ("jurisdictions".to_string(), "California".to_string()),
            ("court_level".to_string(), "trial".to_string()),
            ("matter_posture".to_string(), "MTD".to_string()),
        ]);
        assert!(matches!(lock_intake(&inputs), Err(Error::Validation(_))));
    }

    #[test]
    fn verified_quotes_drop_fabrications() {
        let sources = vec![SourceRef {
            citation_id: 1,
            passage_id: "d_passage_0".to_string(),
            document_title: "Code".to_string(),
            page: None,
            text: "The statute of limitations is four years.".to_string(),
            similarity: 0.9,
        }];
        let quotes = vec![
            QuoteRef {
                quote: "statute of  limitations is four".to_string(),
                citation_id: 1,
            },
            QuoteRef {
                quote: "five years".to_string(),
                citation_id: 1,
            },
            QuoteRef {
                quote: "four years".to_string(),
                citation_id: 99,
            },
        ];
        let kept = verified_quotes(&quotes, &sources);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].quote, "statute of limitations is four");
    }

    #[test]
    fn parse_json_response_tolerates_prose_and_fences() {
        #[derive(Deserialize)]
        struct Out {
            issues: Vec<String>,
        }
        let fenced = "```json\n{\"issues\": [\"a\"]}\n```";
        assert_eq!(
            parse_json_response::<Out>(fenced, "t").unwrap().issues,
            vec!["a"]
        );
        let prosey = "Sure, here you go: {\"issues\": []} hope that helps";
        assert!(parse_json_response::<Out>(prosey, "t").unwrap().issues.is_empty());
        assert!(parse_json_response::<Out>("not json", "t").is_err());
    }

    #[test]
    fn citation_map_keeps_only_known_ids() {
        let sources = vec![SourceRef {
            citation_id: 2,
            passage_id: "p".to_string(),
            document_title: "T".to_string(),
            page: Some(4),
            text: "text".to_string(),
            similarity: 1.0,
        }];
        let map = citation_map("see [2] and [7]", &sources);
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].citation_id, 2);
    }
}
