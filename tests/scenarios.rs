mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use repodoc::chunk::{chunk_id, hash_text};
use repodoc::citation::parse_citations;
use repodoc::config::RetrievalConfig;
use repodoc::draft::Drafter;
use repodoc::judge::Judge;
use repodoc::models::{Chunk, ChunkKind, Evidence, EvidenceSet, Route, SectionSpec, SpanQuality};
use repodoc::retry::RetryPolicy;

fn chunk(path: &str, start: usize, end: usize, kind: ChunkKind, text: &str) -> Arc<Chunk> {
    Arc::new(Chunk {
        id: chunk_id(path, start, end, kind),
        source_path: path.to_string(),
        start_line: start,
        end_line: end,
        kind,
        text: text.to_string(),
        hash: hash_text(text),
        quality: SpanQuality::Exact,
        symbol: None,
    })
}

fn section(id: &str, required: &[&str]) -> SectionSpec {
    SectionSpec {
        id: id.to_string(),
        order: 1,
        title: "Installation & Setup".to_string(),
        query: "environment variables and configuration".to_string(),
        route: Route::Both,
        k_text: None,
        k_code: None,
        guidance: String::new(),
        additional_context: String::new(),
        required_elements: required.iter().map(|s| s.to_string()).collect(),
    }
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        timeout: Duration::from_secs(5),
        base_delay: Duration::from_millis(1),
    }
}

#[tokio::test]
async fn dotenv_claim_cites_the_imports_span() {
    let items = vec![
        chunk("README.md", 1, 6, ChunkKind::Prose, "# Inventory\n\nRun the service with uvicorn."),
        chunk("app/main.py", 1, 9, ChunkKind::Code, "from fastapi import FastAPI\napp = FastAPI()"),
        chunk(
            "app/imports.py",
            12,
            28,
            ChunkKind::Code,
            "def configure():\n    load_dotenv()\n    return os.environ",
        ),
        chunk("app/db.py", 3, 20, ChunkKind::Code, "engine = create_engine(URL)"),
        chunk("requirements.txt", 1, 3, ChunkKind::Prose, "fastapi\nuvicorn\npython-dotenv"),
    ];
    let evidence = EvidenceSet {
        id: "five".to_string(),
        items: items
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| Evidence {
                chunk,
                score: 0.9 - i as f32 * 0.1,
            })
            .collect(),
    };

    let writer = CitingWriter::looking_for("load_dotenv()");
    let retrieval = RetrievalConfig::default();
    let retry = quick_retry();
    let drafter = Drafter {
        generator: &writer,
        retry: &retry,
        retrieval: &retrieval,
    };
    let spec = section("installation", &["environment variables"]);
    let draft = drafter
        .draft(&spec, &spec.query, &evidence, None)
        .await
        .unwrap();

    assert!(draft.text.contains("[app/imports.py:12-28]"));
    assert!(draft.text.to_lowercase().contains("environment variables"));
    let citations = parse_citations(&draft.text);
    assert_eq!(citations.len(), 1);
    let c = &citations[0];
    assert_eq!(c.source_path, "app/imports.py");
    assert!(12 <= c.start_line && c.end_line <= 28);
    assert_eq!(draft.citations, citations);
    assert_eq!(draft.revision, 0);
}

#[tokio::test]
async fn citation_outside_evidence_span_fails_cites_ok() {
    let evidence = EvidenceSet {
        id: "utils".to_string(),
        items: vec![Evidence {
            chunk: chunk(
                "utils.py",
                10,
                20,
                ChunkKind::Code,
                "def slugify(value):\n    return value.lower()",
            ),
            score: 0.8,
        }],
    };
    let draft = repodoc::models::Draft {
        section_id: "utils".to_string(),
        text: "Slugs are lower-cased [utils.py:1-5].".to_string(),
        evidence_set_id: evidence.id.clone(),
        revision: 0,
        citations: parse_citations("Slugs are lower-cased [utils.py:1-5]."),
    };

    // The model would pass the draft; the structural check must not.
    let model = ScriptedJudge::always(verdict(0.95, true));
    let retrieval = RetrievalConfig::default();
    let retry = quick_retry();
    let judge = Judge {
        model: &model,
        retry: &retry,
        retrieval: &retrieval,
    };
    let v = judge
        .judge(&draft, &evidence, &section("utils", &[]))
        .await
        .unwrap();
    assert!(!v.cites_ok);
    assert!(v.notes.contains("utils.py:1-5"));
}
