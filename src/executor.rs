//! Sequential phase executor. Owns all run bookkeeping: status transitions,
//! phase result records, durable saves after every state change, and the
//! verification gate. Phase handlers stay pure; external capabilities are
//! injected at construction.

use crate::engine::WorkflowEngine;
use crate::error::{Error, Result};
use crate::lm::Generator;
use crate::model::{
    now_epoch_ms, PhaseArtifacts, PhaseResult, PhaseSpec, PhaseStatus, WorkflowRun,
    WorkflowStatus,
};
use crate::phases::{self, PhaseOutcome};
use crate::store::Retriever;
use crate::verify::{run_gate, GateInput, GateReport};

pub struct Executor<'a> {
    engine: &'a WorkflowEngine,
    retriever: &'a dyn Retriever,
    generator: &'a dyn Generator,
}

impl<'a> Executor<'a> {
    pub fn new(
        engine: &'a WorkflowEngine,
        retriever: &'a dyn Retriever,
        generator: &'a dyn Generator,
    ) -> Self {
        Self {
            engine,
            retriever,
            generator,
        }
    }

    /// Execute exactly one phase of the run, or park it for human input.
    /// Phase failure is recorded state, not an error: the returned run
    /// carries FAILED status and an error message.
    pub fn advance(&self, run_id: &str) -> Result<WorkflowRun> {
        let mut run = self.engine.get_run(run_id)?;
        if run.status.is_terminal() {
            return Err(Error::Validation(format!(
                "run {run_id} already finished with status {:?}",
                run.status
            )));
        }
        if run.status == WorkflowStatus::NeedsInput {
            return Err(Error::Validation(format!(
                "run {run_id} is waiting on human input; resume it instead"
            )));
        }
        let definition = self.engine.get_definition(&run.definition_id)?;
        let index = run.current_phase;
        let Some(spec) = definition.phases.get(index) else {
            return Err(Error::Validation(format!(
                "run {run_id} points past the last phase"
            )));
        };

        if run.status == WorkflowStatus::Pending {
            run.transition(WorkflowStatus::Running)?;
        }
        if spec.requires_human_input {
            run.transition(WorkflowStatus::NeedsInput)?;
            self.engine.save_run(&run)?;
            tracing::info!(run_id, phase = %spec.phase_id, "run parked for human input");
            return Ok(run);
        }

        run.phase_results[index].status = PhaseStatus::Running;
        run.phase_results[index].started_at = now_epoch_ms().ok();
        self.engine.save_run(&run)?;
        tracing::info!(run_id, phase = %spec.phase_id, "phase started");

        match self.dispatch(&run, spec, index) {
            Ok(outcome) => self.complete_phase(run, index, outcome),
            Err(err) => self.fail_phase(run, spec, index, err),
        }
    }

    /// Drive the run until it parks on human input, fails, or completes.
    pub fn run_to_completion(&self, run_id: &str) -> Result<WorkflowRun> {
        loop {
            let run = self.advance(run_id)?;
            match run.status {
                WorkflowStatus::Running => continue,
                _ => return Ok(run),
            }
        }
    }

    /// Resolve the human-input phase a run is parked on. For intake this
    /// locks the run inputs; for review the notes are recorded as the
    /// reviewer's judgment. The run then returns to RUNNING.
    pub fn resume(&self, run_id: &str, notes: Vec<String>) -> Result<WorkflowRun> {
        let mut run = self.engine.get_run(run_id)?;
        if run.status != WorkflowStatus::NeedsInput {
            return Err(Error::Validation(format!(
                "run {run_id} is not waiting on human input (status {:?})",
                run.status
            )));
        }
        let definition = self.engine.get_definition(&run.definition_id)?;
        let index = run.current_phase;
        let spec = &definition.phases[index];
        if !spec.requires_human_input {
            return Err(Error::Validation(format!(
                "phase {} does not take human input",
                spec.phase_id
            )));
        }

        run.phase_results[index].started_at = now_epoch_ms().ok();
        run.transition(WorkflowStatus::Running)?;
        let artifacts = if index == 0 {
            match phases::lock_intake(&run.inputs) {
                Ok(artifacts) => artifacts,
                Err(err) => return self.fail_phase(run, spec, index, err),
            }
        } else {
            PhaseArtifacts::HumanInput {
                notes: notes.clone(),
            }
        };
        tracing::info!(run_id, phase = %spec.phase_id, "human input received");
        self.complete_phase(
            run,
            index,
            PhaseOutcome {
                artifacts,
                sources: Vec::new(),
                logs: notes,
            },
        )
    }

    /// Explicit external resumption after a failure: discard the results of
    /// the targeted phase and everything after it, clear the failure state,
    /// and point the executor back at the target.
    pub fn rerun_phase(&self, run_id: &str, phase_index: usize) -> Result<WorkflowRun> {
        let mut run = self.engine.get_run(run_id)?;
        if run.status != WorkflowStatus::Failed {
            return Err(Error::Validation(format!(
                "run {run_id} has not failed; nothing to rerun"
            )));
        }
        let definition = self.engine.get_definition(&run.definition_id)?;
        let Some(spec) = definition.phases.get(phase_index) else {
            return Err(Error::Validation(format!(
                "definition {} has no phase {phase_index}",
                run.definition_id
            )));
        };
        if spec.requires_human_input {
            return Err(Error::Validation(format!(
                "phase {} takes human input; it cannot be rerun mechanically",
                spec.phase_id
            )));
        }
        if phase_index > run.current_phase {
            return Err(Error::Validation(format!(
                "phase {phase_index} was never reached; rerun a completed or failed phase"
            )));
        }

        for result in run.phase_results.iter_mut().skip(phase_index) {
            let phase_id = result.phase_id.clone();
            *result = PhaseResult::pending(&phase_id);
        }
        run.current_phase = phase_index;
        run.status = WorkflowStatus::Running;
        run.finished_at = None;
        run.error_message = None;
        run.correction_plan = None;
        self.engine.save_run(&run)?;
        tracing::info!(run_id, phase = %spec.phase_id, "rerunning from phase");
        Ok(run)
    }

    /// Index-keyed dispatch over the built-in phase sequence. The phase id
    /// is cross-checked so a mismatched definition fails loudly instead of
    /// running the wrong handler.
    fn dispatch(&self, run: &WorkflowRun, spec: &PhaseSpec, index: usize) -> Result<PhaseOutcome> {
        let expect = |phase_id: &str| -> Result<()> {
            if spec.phase_id == phase_id {
                Ok(())
            } else {
                Err(Error::Validation(format!(
                    "phase {index} is {}, expected {phase_id}",
                    spec.phase_id
                )))
            }
        };
        match index {
            1 => {
                expect("phase_1_authority_grounding")?;
                phases::authority_grounding(run, self.retriever, self.generator)
            }
            2 => {
                expect("phase_2_case_retrieval")?;
                phases::case_retrieval(run, self.retriever, self.generator)
            }
            3 => {
                expect("phase_3_authority_validation")?;
                phases::authority_validation(run, self.retriever)
            }
            4 => {
                expect("phase_4_issue_decomposition")?;
                phases::issue_decomposition(run, self.generator)
            }
            5 => {
                expect("phase_5_rule_extraction")?;
                phases::rule_extraction(run)
            }
            6 => {
                expect("phase_6_rule_application")?;
                phases::rule_application(run, self.generator)
            }
            7 => {
                expect("phase_7_memo_drafting")?;
                phases::drafting(run, self.generator)
            }
            8 => {
                expect("phase_8_verification")?;
                self.verification_phase(run)
            }
            10 => {
                expect("phase_10_export")?;
                phases::export_assembly(run)
            }
            _ => Err(Error::Validation(format!(
                "no handler for phase {index} ({})",
                spec.phase_id
            ))),
        }
    }

    /// The hard gate. A failing report surfaces as a phase failure carrying
    /// the correction plan; the per-check outcomes are preserved either way.
    fn verification_phase(&self, run: &WorkflowRun) -> Result<PhaseOutcome> {
        let report = self.gate_report(run)?;
        let logs = report
            .outcomes
            .iter()
            .map(|o| {
                format!(
                    "{} {}: {}",
                    if o.passed { "PASS" } else { "FAIL" },
                    o.name,
                    o.details
                )
            })
            .collect();
        if report.passed {
            Ok(PhaseOutcome {
                artifacts: PhaseArtifacts::Verification {
                    passed: true,
                    outcomes: report.outcomes,
                },
                sources: Vec::new(),
                logs,
            })
        } else {
            let summary = report
                .outcomes
                .iter()
                .filter(|o| !o.passed)
                .map(|o| format!("{}: {}", o.check_id, o.details))
                .collect::<Vec<_>>()
                .join("; ");
            Err(Error::GateFailure {
                summary,
                outcomes: report.outcomes,
                correction_plan: report.correction_plan,
                logs,
            })
        }
    }

    fn gate_report(&self, run: &WorkflowRun) -> Result<GateReport> {
        let draft = phases::draft_of(run)?;
        let rules = phases::rules_of(run)?;
        let (authorities, jurisdictions) = match (run.artifacts_of(3), run.artifacts_of(0)) {
            (
                Some(PhaseArtifacts::AuthorityValidation { authorities }),
                Some(PhaseArtifacts::Intake {
                    locked_jurisdictions,
                    ..
                }),
            ) => (authorities.as_slice(), locked_jurisdictions.as_slice()),
            _ => {
                return Err(Error::Validation(
                    "verification requires completed validation and intake phases".to_string(),
                ))
            }
        };
        let sources = run.accumulated_sources();
        Ok(run_gate(&GateInput {
            draft,
            locked_jurisdictions: jurisdictions,
            authorities,
            rules,
            sources: &sources,
        }))
    }

    fn complete_phase(
        &self,
        mut run: WorkflowRun,
        index: usize,
        outcome: PhaseOutcome,
    ) -> Result<WorkflowRun> {
        let result = &mut run.phase_results[index];
        debug_assert!(result.artifacts.is_none(), "phase artifacts are write-once");
        result.status = PhaseStatus::Completed;
        result.artifacts = Some(outcome.artifacts);
        result.sources = outcome.sources;
        result.logs.extend(outcome.logs);
        result.finished_at = now_epoch_ms().ok();
        if result.started_at.is_none() {
            result.started_at = result.finished_at;
        }

        run.current_phase = index + 1;
        if run.current_phase >= run.phase_results.len() {
            run.transition(WorkflowStatus::Completed)?;
            tracing::info!(run_id = %run.run_id, "run completed");
        }
        self.engine.save_run(&run)?;
        Ok(run)
    }

    fn fail_phase(
        &self,
        mut run: WorkflowRun,
        spec: &PhaseSpec,
        index: usize,
        err: Error,
    ) -> Result<WorkflowRun> {
        let message;
        {
            let result = &mut run.phase_results[index];
            result.status = PhaseStatus::Failed;
            result.finished_at = now_epoch_ms().ok();
            match err {
                Error::GateFailure {
                    summary,
                    outcomes,
                    correction_plan,
                    logs,
                } => {
                    message = format!("verification gate failed: {summary}");
                    result.artifacts = Some(PhaseArtifacts::Verification {
                        passed: false,
                        outcomes,
                    });
                    result.logs.extend(logs);
                    run.correction_plan = Some(correction_plan);
                }
                other => {
                    message = other.to_string();
                }
            }
            run.phase_results[index].errors.push(message.clone());
        }
        run.error_message = Some(format!("phase {} failed: {message}", spec.phase_id));
        run.transition(WorkflowStatus::Failed)?;
        self.engine.save_run(&run)?;
        tracing::warn!(run_id = %run.run_id, phase = %spec.phase_id, error = %message, "phase failed");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::litigation_memo_definition;
    use crate::store::SimilarityHit;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    const STATUTE_TEXT: &str =
        "The statute of limitations is four years for breach of contract claims.";
    const CASE_TEXT: &str =
        "The court held in Smith v. Jones that the discovery rule applies to contract actions.";

    struct ScriptedRetriever;

    impl Retriever for ScriptedRetriever {
        fn search(&self, query: &str, _top_k: usize) -> crate::error::Result<Vec<SimilarityHit>> {
            // Validation queries carry the treatment vocabulary; report no
            // adverse passages for them.
            if query.contains("overruled") {
                return Ok(Vec::new());
            }
            let hit = |ordinal: usize, text: &str, similarity: f32| SimilarityHit {
                passage_id: format!("corpus_passage_{ordinal}"),
                document_id: "corpus".to_string(),
                document_title: "Research Corpus".to_string(),
                text: text.to_string(),
                page: Some(ordinal as u32 + 1),
                ordinal,
                similarity,
            };
            Ok(vec![hit(0, STATUTE_TEXT, 0.91), hit(1, CASE_TEXT, 0.84)])
        }
    }

    struct ScriptedGenerator {
        predict_outcome: AtomicBool,
    }

    impl ScriptedGenerator {
        fn new() -> Self {
            Self {
                predict_outcome: AtomicBool::new(false),
            }
        }
    }

    impl Generator for ScriptedGenerator {
        fn generate(&self, prompt: &str, _max_output_chars: usize) -> crate::error::Result<String> {
            if prompt.contains("Identify statutes") {
                return Ok(r#"{"authorities": [{"kind": "statute",
                    "name": "Limitations Act", "jurisdiction": "California",
                    "quotes": [{"quote": "statute of limitations is four years",
                    "citation_id": 1}]}]}"#
                    .to_string());
            }
            if prompt.contains("Identify court cases") {
                // Case retrieval keeps only the opinion-flavored passage, so
                // its single source carries the next citation number.
                return Ok(r#"{"cases": [{"caption": "Smith v. Jones",
                    "jurisdiction": "California",
                    "quotes": [{"quote": "the discovery rule applies",
                    "citation_id": 3}]}]}"#
                    .to_string());
            }
            if prompt.contains("issue tree") {
                return Ok(r#"{"issues": [{"element": "Timeliness of the claim",
                    "authority_ids": ["auth_1", "case_1"], "uncertainty": true,
                    "notes": "accrual date unresolved"},
                    {"element": "Unmoored theory", "authority_ids": ["auth_99"]}]}"#
                    .to_string());
            }
            if prompt.contains("Apply these legal rules") {
                return Ok(r#"{"analysis": "If the claim accrued within four years it may be timely; assuming the discovery rule applies, accrual could be delayed.",
                    "gaps": ["accrual date unknown"], "uncertainties": []}"#
                    .to_string());
            }
            if prompt.contains("Draft a legal research memorandum") {
                if self.predict_outcome.load(Ordering::SeqCst) {
                    return Ok("The client will definitely win because the \
                               Limitations Act [1] is clear."
                        .to_string());
                }
                return Ok("QUESTION PRESENTED\nWhether the claim is timely.\n\n\
                           SHORT ANSWER\nIf the claim accrued within four years, it may be \
                           timely [1]. Assuming the discovery rule of Smith v. Jones applies, \
                           accrual could be delayed [3]. To the extent accrual is disputed, \
                           further facts are needed.\n\n\
                           OPEN QUESTIONS\nThe accrual date remains unestablished."
                    .to_string());
            }
            panic!("unexpected prompt: {}", &prompt[..prompt.len().min(80)]);
        }
    }

    fn run_inputs() -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "research_question".to_string(),
                "Is the breach of contract claim time-barred?".to_string(),
            ),
            ("jurisdictions".to_string(), "California".to_string()),
            ("court_level".to_string(), "trial".to_string()),
            ("matter_posture".to_string(), "motion to dismiss".to_string()),
        ])
    }

    fn engine_in(dir: &tempfile::TempDir) -> WorkflowEngine {
        let engine = WorkflowEngine::open(dir.path()).unwrap();
        engine.register_definition(litigation_memo_definition()).unwrap();
        engine
    }

    #[test]
    fn full_run_parks_twice_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);
        let retriever = ScriptedRetriever;
        let generator = ScriptedGenerator::new();
        let executor = Executor::new(&engine, &retriever, &generator);
        let run = engine
            .create_run("litigation_research_memo_v1", "ada", run_inputs())
            .unwrap();

        // Intake parks immediately.
        let run = executor.advance(&run.run_id).unwrap();
        assert_eq!(run.status, WorkflowStatus::NeedsInput);
        assert_eq!(run.current_phase, 0);

        let run = executor.resume(&run.run_id, Vec::new()).unwrap();
        assert_eq!(run.status, WorkflowStatus::Running);
        assert_eq!(run.current_phase, 1);

        // Phases 1 through 8 execute mechanically, then human review parks.
        let run = executor.run_to_completion(&run.run_id).unwrap();
        assert_eq!(run.status, WorkflowStatus::NeedsInput, "{:?}", run.error_message);
        assert_eq!(run.current_phase, 9);
        match run.artifacts_of(8) {
            Some(PhaseArtifacts::Verification { passed, outcomes }) => {
                assert!(passed, "{outcomes:?}");
                assert_eq!(outcomes.len(), 6);
            }
            other => panic!("unexpected verification artifacts: {other:?}"),
        }
        // The unmoored issue was dropped during decomposition.
        match run.artifacts_of(4) {
            Some(PhaseArtifacts::IssueDecomposition { issue_tree }) => {
                assert_eq!(issue_tree.len(), 1);
                assert_eq!(issue_tree[0].authority_ids, vec!["auth_1", "case_1"]);
            }
            other => panic!("unexpected issue artifacts: {other:?}"),
        }

        let run = executor.resume(&run.run_id, vec!["approved".to_string()]).unwrap();
        let run = executor.run_to_completion(&run.run_id).unwrap();
        assert_eq!(run.status, WorkflowStatus::Completed);
        assert!(run.finished_at.is_some());
        match run.artifacts_of(10) {
            Some(PhaseArtifacts::Export { citation_map, authority_table, .. }) => {
                assert!(citation_map.iter().any(|s| s.citation_id == 1));
                assert!(citation_map.iter().any(|s| s.citation_id == 3));
                assert_eq!(authority_table.len(), 2);
            }
            other => panic!("unexpected export artifacts: {other:?}"),
        }
    }

    #[test]
    fn gate_failure_pins_run_with_correction_plan_and_rerun_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);
        let retriever = ScriptedRetriever;
        let generator = ScriptedGenerator::new();
        generator.predict_outcome.store(true, Ordering::SeqCst);
        let executor = Executor::new(&engine, &retriever, &generator);
        let run = engine
            .create_run("litigation_research_memo_v1", "ada", run_inputs())
            .unwrap();
        executor.advance(&run.run_id).unwrap();
        executor.resume(&run.run_id, Vec::new()).unwrap();

        let run = executor.run_to_completion(&run.run_id).unwrap();
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.current_phase, 8, "run stays pinned at the gate");
        let plan = run.correction_plan.as_ref().expect("correction plan attached");
        assert!(plan.iter().any(|item| item.check == "reasoning_structure"));
        assert!(run
            .error_message
            .as_deref()
            .unwrap()
            .contains("verification gate failed"));
        // Gate outcomes are recorded even though the phase failed.
        match run.artifacts_of(8) {
            Some(PhaseArtifacts::Verification { passed, .. }) => assert!(!passed),
            other => panic!("unexpected verification artifacts: {other:?}"),
        }
        // A terminal run refuses further mechanical advancement.
        assert!(executor.advance(&run.run_id).is_err());

        // Fix the drafting behavior and rerun from the offending phase.
        generator.predict_outcome.store(false, Ordering::SeqCst);
        let run = executor.rerun_phase(&run.run_id, 7).unwrap();
        assert_eq!(run.status, WorkflowStatus::Running);
        assert_eq!(run.current_phase, 7);
        assert!(run.correction_plan.is_none());
        assert!(run.phase_results[8].artifacts.is_none());

        let run = executor.run_to_completion(&run.run_id).unwrap();
        assert_eq!(run.status, WorkflowStatus::NeedsInput);
        assert_eq!(run.current_phase, 9);
    }

    #[test]
    fn rerun_rejects_human_phases_and_unreached_phases() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);
        let retriever = ScriptedRetriever;
        let generator = ScriptedGenerator::new();
        generator.predict_outcome.store(true, Ordering::SeqCst);
        let executor = Executor::new(&engine, &retriever, &generator);
        let run = engine
            .create_run("litigation_research_memo_v1", "ada", run_inputs())
            .unwrap();
        executor.advance(&run.run_id).unwrap();
        executor.resume(&run.run_id, Vec::new()).unwrap();
        let run = executor.run_to_completion(&run.run_id).unwrap();
        assert_eq!(run.status, WorkflowStatus::Failed);

        assert!(executor.rerun_phase(&run.run_id, 0).is_err());
        assert!(executor.rerun_phase(&run.run_id, 10).is_err());
    }

    #[test]
    fn resume_requires_parked_run() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(&dir);
        let retriever = ScriptedRetriever;
        let generator = ScriptedGenerator::new();
        let executor = Executor::new(&engine, &retriever, &generator);
        let run = engine
            .create_run("litigation_research_memo_v1", "ada", run_inputs())
            .unwrap();
        assert!(executor.resume(&run.run_id, Vec::new()).is_err());
    }
}
