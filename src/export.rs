//! Rendering of a completed run's export artifacts: a human-readable
//! `memo.md` and a machine-readable `report.json` audit bundle.

use crate::error::{Error, Result};
use crate::model::{
    Authority, IssueNode, PhaseArtifacts, SourceRef, VerificationOutcome, WorkflowRun,
};
use crate::store::write_json_atomic;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct Report<'a> {
    run_id: &'a str,
    definition_id: &'a str,
    owner: &'a str,
    inputs: &'a BTreeMap<String, String>,
    memo: &'a str,
    authority_table: &'a [Authority],
    issue_tree: &'a [IssueNode],
    verification: &'a [VerificationOutcome],
    citation_map: &'a [SourceRef],
}

/// Write `memo.md` and `report.json` for a run whose export phase has
/// completed. Returns the paths written.
pub fn write_bundle(run: &WorkflowRun, out_dir: &Path) -> Result<Vec<PathBuf>> {
    let Some(PhaseArtifacts::Export {
        memo,
        authority_table,
        issue_tree,
        outcomes,
        citation_map,
    }) = run.artifacts_of(10)
    else {
        return Err(Error::Validation(format!(
            "run {} has no export artifacts; the run must complete first",
            run.run_id
        )));
    };

    std::fs::create_dir_all(out_dir).map_err(|e| Error::io("create", out_dir, e))?;
    let memo_path = out_dir.join("memo.md");
    let rendered = render_memo(memo, authority_table, citation_map);
    std::fs::write(&memo_path, rendered).map_err(|e| Error::io("write", &memo_path, e))?;

    let report_path = out_dir.join("report.json");
    write_json_atomic(
        &report_path,
        &Report {
            run_id: &run.run_id,
            definition_id: &run.definition_id,
            owner: &run.owner,
            inputs: &run.inputs,
            memo,
            authority_table,
            issue_tree,
            verification: outcomes,
            citation_map,
        },
    )?;
    tracing::info!(run_id = %run.run_id, out_dir = %out_dir.display(), "export bundle written");
    Ok(vec![memo_path, report_path])
}

/// The memo followed by an authority table and a citation appendix mapping
/// every bracket number used in the draft back to its passage.
fn render_memo(memo: &str, authorities: &[Authority], citation_map: &[SourceRef]) -> String {
    let mut out = String::from(memo.trim_end());
    out.push_str("\n\n## Authority Table\n\n");
    out.push_str("| Authority | Kind | Jurisdiction | Status |\n");
    out.push_str("|---|---|---|---|\n");
    for authority in authorities {
        out.push_str(&format!(
            "| {} | {:?} | {} | {:?} |\n",
            authority.name, authority.kind, authority.jurisdiction, authority.precedential_status
        ));
    }
    out.push_str("\n## Citations\n\n");
    for source in citation_map {
        let page = source
            .page
            .map(|p| format!(", page {p}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "[{}] {}{page}: \"{}\"\n",
            source.citation_id,
            source.document_title,
            truncate_excerpt(&source.text, 240)
        ));
    }
    out
}

fn truncate_excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthorityKind, PrecedentialStatus};

    fn source(citation_id: usize, text: &str) -> SourceRef {
        SourceRef {
            citation_id,
            passage_id: format!("doc_passage_{citation_id}"),
            document_title: "Civil Code".to_string(),
            page: Some(12),
            text: text.to_string(),
            similarity: 0.9,
        }
    }

    #[test]
    fn memo_rendering_appends_table_and_appendix() {
        let authorities = vec![Authority {
            authority_id: "auth_1".to_string(),
            kind: AuthorityKind::Statute,
            name: "Limitations Act".to_string(),
            jurisdiction: "California".to_string(),
            supporting_quotes: Vec::new(),
            precedential_status: PrecedentialStatus::TreatedAsGoodLawInDocs,
            treatment_evidence: None,
        }];
        let citation_map = vec![source(1, "The limitations period is four years.")];
        let rendered = render_memo("The claim may be barred [1].", &authorities, &citation_map);
        assert!(rendered.starts_with("The claim may be barred [1]."));
        assert!(rendered.contains("## Authority Table"));
        assert!(rendered.contains("| Limitations Act | Statute | California |"));
        assert!(rendered.contains("[1] Civil Code, page 12"));
    }

    #[test]
    fn bundle_refuses_run_without_export_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = crate::engine::WorkflowEngine::open(dir.path()).unwrap();
        engine
            .register_definition(crate::phases::litigation_memo_definition())
            .unwrap();
        let inputs = BTreeMap::from([
            ("research_question".to_string(), "Q".to_string()),
            ("jurisdictions".to_string(), "California".to_string()),
            ("court_level".to_string(), "trial".to_string()),
            ("matter_posture".to_string(), "MTD".to_string()),
        ]);
        let run = engine
            .create_run("litigation_research_memo_v1", "ada", inputs)
            .unwrap();
        assert!(write_bundle(&run, &dir.path().join("out")).is_err());
    }

    #[test]
    fn long_excerpts_are_truncated() {
        let long = "word ".repeat(100);
        let excerpt = truncate_excerpt(&long, 40);
        assert!(excerpt.ends_with("..."));
        assert_eq!(excerpt.chars().count(), 43);
    }
}
