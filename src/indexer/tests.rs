use super::*;
use crate::embeddings::chunking::ChunkingConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;

const KEYWORDS: [&str; 3] = ["pricing", "security", "onboarding"];

/// Embeds text as keyword counts so similarity is predictable
#[derive(Debug, Default)]
struct KeywordEmbedder {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl Embedder for KeywordEmbedder {
    fn model(&self) -> &str {
        "keyword-test"
    }

    fn dimension(&self) -> usize {
        KEYWORDS.len()
    }

    fn embed(&self, texts: &[String], _input_type: InputType) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(KnowledgeError::Embedding(anyhow!(
                "embedding service unavailable"
            )));
        }
        Ok(texts.iter().map(|text| keyword_vector(text)).collect())
    }
}

fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .map(|keyword| 0.1 + lower.matches(keyword).count() as f32)
        .collect()
}

struct Harness {
    indexer: Arc<KnowledgeIndexer>,
    embedder: Arc<KeywordEmbedder>,
    index: Arc<LanceIndex>,
    _temp_dir: TempDir,
}

fn small_chunks() -> ChunkingConfig {
    ChunkingConfig {
        chunk_size: 8,
        overlap: 2,
    }
}

async fn create_harness() -> Harness {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = Arc::new(
        LanceIndex::open(&temp_dir.path().join("vectors"), "chunks", KEYWORDS.len())
            .await
            .expect("should open lance index"),
    );
    let embedder = Arc::new(KeywordEmbedder::default());
    let chunker = TokenChunker::new(small_chunks()).expect("chunker should build");

    let indexer = KnowledgeIndexer::new(
        Arc::clone(&embedder) as Arc<dyn Embedder>,
        Arc::clone(&index) as Arc<dyn VectorIndex>,
        chunker,
    );

    Harness {
        indexer: Arc::new(indexer),
        embedder,
        index,
        _temp_dir: temp_dir,
    }
}

/// Repeat a sentence until the text splits into exactly `chunk_count` chunks
fn text_with_chunks(chunk_count: usize) -> String {
    let chunker = TokenChunker::new(small_chunks()).expect("chunker should build");
    (1..200)
        .map(|repeats| "Pricing notes. ".repeat(repeats))
        .find(|text| {
            chunker
                .chunk_text(text)
                .expect("chunking should succeed")
                .len()
                == chunk_count
        })
        .expect("some repetition should produce the requested chunk count")
}

fn source_file(file_id: &str, organization_id: &str, text: &str) -> SourceFile {
    SourceFile {
        file_id: file_id.to_string(),
        organization_id: organization_id.to_string(),
        mime_type: "text/plain".to_string(),
        bytes: text.as_bytes().to_vec(),
        extra: BTreeMap::new(),
    }
}

async fn stored_ids(index: &LanceIndex, file_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = index
        .query(&[1.0, 1.0, 1.0], 1000, &MetadataFilter::for_file(file_id), false)
        .await
        .expect("query should succeed")
        .into_iter()
        .map(|found| found.id)
        .collect();
    ids.sort();
    ids
}

fn expected_ids(file_id: &str, chunk_count: usize) -> Vec<String> {
    let mut ids: Vec<String> = (0..chunk_count)
        .map(|i| format!("{}:{}", file_id, i))
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn ingest_writes_one_vector_per_chunk() {
    let harness = create_harness().await;
    let text = text_with_chunks(3);

    let report = harness
        .indexer
        .ingest_file(source_file("f1", "org-a", &text))
        .await
        .expect("ingest should succeed");

    assert_eq!(report.file_id, "f1");
    assert_eq!(report.chunk_count, 3);
    assert_eq!(report.upserted_count, 3);
    assert!(report.token_count >= 3);
    assert_eq!(stored_ids(&harness.index, "f1").await, expected_ids("f1", 3));
    assert_eq!(harness.embedder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.indexer.locks().active_keys(), 0);
}

#[tokio::test]
async fn reingest_replaces_stale_chunks() {
    let harness = create_harness().await;

    harness
        .indexer
        .ingest_file(source_file("f1", "org-a", &text_with_chunks(3)))
        .await
        .expect("first ingest should succeed");
    let report = harness
        .indexer
        .ingest_file(source_file("f1", "org-a", &text_with_chunks(2)))
        .await
        .expect("second ingest should succeed");

    assert_eq!(report.chunk_count, 2);
    assert_eq!(
        stored_ids(&harness.index, "f1").await,
        vec!["f1:0".to_string(), "f1:1".to_string()]
    );
}

#[tokio::test]
async fn file_without_text_removes_previous_vectors() {
    let harness = create_harness().await;
    harness
        .indexer
        .ingest_file(source_file("f1", "org-a", &text_with_chunks(2)))
        .await
        .expect("first ingest should succeed");

    let report = harness
        .indexer
        .ingest_file(source_file("f1", "org-a", "   \n\t  "))
        .await
        .expect("blank ingest should succeed");

    assert_eq!(report.chunk_count, 0);
    assert_eq!(report.upserted_count, 0);
    assert!(stored_ids(&harness.index, "f1").await.is_empty());
}

#[tokio::test]
async fn embedding_failure_keeps_previous_vectors() {
    let harness = create_harness().await;
    harness
        .indexer
        .ingest_file(source_file("f1", "org-a", &text_with_chunks(2)))
        .await
        .expect("first ingest should succeed");

    harness.embedder.fail.store(true, Ordering::SeqCst);
    let error = harness
        .indexer
        .ingest_file(source_file("f1", "org-a", &text_with_chunks(3)))
        .await
        .expect_err("failing embedder should fail ingest");

    assert!(matches!(error, KnowledgeError::Embedding(_)));
    assert!(error.is_retryable());
    assert_eq!(stored_ids(&harness.index, "f1").await, expected_ids("f1", 2));
}

#[tokio::test]
async fn unsupported_file_is_rejected_before_embedding() {
    let harness = create_harness().await;
    let mut file = source_file("f1", "org-a", "binary");
    file.mime_type = "image/png".to_string();

    let error = harness
        .indexer
        .ingest_file(file)
        .await
        .expect_err("png should be rejected");

    assert!(matches!(error, KnowledgeError::UnsupportedFileType(_)));
    assert_eq!(harness.embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn extra_fields_reach_vector_metadata() {
    let harness = create_harness().await;
    let mut file = source_file("f1", "org-a", "Onboarding checklist for new accounts.");
    file.extra = BTreeMap::from([("deal_id".to_string(), Value::from("deal-3"))]);

    harness
        .indexer
        .ingest_file(file)
        .await
        .expect("ingest should succeed");

    let matches = harness
        .index
        .query(&[1.0, 1.0, 1.0], 10, &MetadataFilter::for_file("f1"), true)
        .await
        .expect("query should succeed");
    let metadata = matches[0].metadata.as_ref().expect("metadata included");
    assert_eq!(metadata.organization_id, "org-a");
    assert_eq!(metadata.extra.get("deal_id"), Some(&Value::from("deal-3")));
    assert!(metadata.indexed_at.is_some());
}

#[tokio::test]
async fn search_is_scoped_to_organization() {
    let harness = create_harness().await;
    for (file_id, organization_id, text) in [
        ("pricing-a", "org-a", "Pricing tiers and pricing discounts."),
        ("security-a", "org-a", "Security review and security questionnaire."),
        ("pricing-b", "org-b", "Pricing for the other tenant."),
    ] {
        harness
            .indexer
            .ingest_file(source_file(file_id, organization_id, text))
            .await
            .expect("ingest should succeed");
    }

    let hits = harness
        .indexer
        .search(SearchRequest {
            query: "pricing".to_string(),
            organization_id: "org-a".to_string(),
            file_id: None,
            top_k: 5,
        })
        .await
        .expect("search should succeed");

    assert!(!hits.is_empty());
    assert_eq!(hits[0].file_id, "pricing-a");
    assert!(hits.iter().all(|hit| hit.file_id != "pricing-b"));
    assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
    assert!(
        hits[0]
            .content
            .as_deref()
            .is_some_and(|content| content.to_lowercase().contains("pricing"))
    );
}

#[tokio::test]
async fn search_can_narrow_to_one_file() {
    let harness = create_harness().await;
    for file_id in ["f1", "f2"] {
        harness
            .indexer
            .ingest_file(source_file(file_id, "org-a", "Pricing overview."))
            .await
            .expect("ingest should succeed");
    }

    let hits = harness
        .indexer
        .search(SearchRequest {
            query: "pricing".to_string(),
            organization_id: "org-a".to_string(),
            file_id: Some("f2".to_string()),
            top_k: 10,
        })
        .await
        .expect("search should succeed");

    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.file_id == "f2"));
}

#[tokio::test]
async fn blank_query_returns_nothing_without_embedding() {
    let harness = create_harness().await;

    let hits = harness
        .indexer
        .search(SearchRequest {
            query: "   ".to_string(),
            organization_id: "org-a".to_string(),
            file_id: None,
            top_k: 5,
        })
        .await
        .expect("blank search should succeed");

    assert!(hits.is_empty());
    assert_eq!(harness.embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn remove_file_deletes_its_vectors() {
    let harness = create_harness().await;
    harness
        .indexer
        .ingest_file(source_file("f1", "org-a", &text_with_chunks(2)))
        .await
        .expect("ingest should succeed");
    harness
        .indexer
        .ingest_file(source_file("f2", "org-a", &text_with_chunks(2)))
        .await
        .expect("ingest should succeed");

    harness
        .indexer
        .remove_file("f1")
        .await
        .expect("remove should succeed");

    assert!(stored_ids(&harness.index, "f1").await.is_empty());
    assert_eq!(stored_ids(&harness.index, "f2").await, expected_ids("f2", 2));
    harness
        .indexer
        .remove_file("f1")
        .await
        .expect("second remove should succeed");
}

#[tokio::test]
async fn concurrent_reingests_leave_one_consistent_version() {
    let harness = create_harness().await;
    let long_text = text_with_chunks(4);
    let short_text = text_with_chunks(2);

    let first = {
        let indexer = Arc::clone(&harness.indexer);
        tokio::spawn(async move {
            indexer
                .ingest_file(source_file("f1", "org-a", &long_text))
                .await
        })
    };
    let second = {
        let indexer = Arc::clone(&harness.indexer);
        tokio::spawn(async move {
            indexer
                .ingest_file(source_file("f1", "org-a", &short_text))
                .await
        })
    };
    first
        .await
        .expect("task should finish")
        .expect("first ingest should succeed");
    second
        .await
        .expect("task should finish")
        .expect("second ingest should succeed");

    let ids = stored_ids(&harness.index, "f1").await;
    assert!(
        ids == expected_ids("f1", 4) || ids == expected_ids("f1", 2),
        "unexpected id set {:?}",
        ids
    );
}

#[test]
fn hits_fall_back_to_vector_ids_without_metadata() {
    let hit = SearchHit::from_match(QueryMatch {
        id: "folder:file:7".to_string(),
        score: 0.5,
        metadata: None,
    })
    .expect("id should parse");

    assert_eq!(hit.file_id, "folder:file");
    assert_eq!(hit.chunk_index, 7);
    assert!(hit.content.is_none());
    assert!(
        SearchHit::from_match(QueryMatch {
            id: "no-index".to_string(),
            score: 0.5,
            metadata: None,
        })
        .is_none()
    );
}
