//! End-to-end pipeline runs over temporary directories.
//!
//! Model-backed stages use deterministic in-process collaborators, so these
//! tests exercise the full split → chunk → summarize → rollup path,
//! resume behavior and stage selection without any network access.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use archive_resegmenter::pipeline::index::{
    CHUNK_INDEX_FILE, THREAD_INDEX_FILE, THREAD_SENTIMENT_INDEX_FILE,
};
use archive_resegmenter::{
    CancellationToken, Chunk, ChunkSentimentDraft, ChunkSentimentSummarizer, ChunkSentimentSummary,
    ChunkSummarizer, ChunkSummary, ChunkSummaryDraft, ElementErrorPolicy, GlossaryAddition,
    Pipeline, PipelineConfig, PipelineError, ProviderError, Stage, StageSelection,
    ThreadIndexRecord, ThreadRolluper, ThreadSentimentRolluper, ThreadSentimentSummary,
    ThreadSummary,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Summarizes by echoing message texts; rolls up by joining summaries.
#[derive(Default)]
struct Scripted {
    summaries: AtomicUsize,
    rollups: AtomicUsize,
}

impl ChunkSummarizer for Scripted {
    fn summarize(
        &self,
        chunk: &Chunk,
        _excerpt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ChunkSummaryDraft, ProviderError> {
        self.summaries.fetch_add(1, Ordering::SeqCst);
        let texts: Vec<&str> = chunk.messages.iter().map(|m| m.text.as_str()).collect();
        Ok(ChunkSummaryDraft {
            summary: texts.join(" / "),
            tags: vec!["archive".into(), "Archive".into()],
            terms: vec!["resegmenter".into()],
            glossary_additions: vec![GlossaryAddition {
                term: "resegmenter".into(),
                definition: "splits archives".into(),
            }],
            ..ChunkSummaryDraft::default()
        })
    }
}

impl ChunkSentimentSummarizer for Scripted {
    fn summarize_sentiment(
        &self,
        chunk: &Chunk,
        _excerpt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ChunkSentimentDraft, ProviderError> {
        Ok(ChunkSentimentDraft {
            emotional_summary: format!("{} messages of calm", chunk.messages.len()),
            dominant_emotions: vec!["calm".into()],
            ..ChunkSentimentDraft::default()
        })
    }
}

impl ThreadRolluper for Scripted {
    fn rollup(
        &self,
        _conversation_id: &str,
        items: &[ChunkSummary],
        _excerpt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ThreadSummary, ProviderError> {
        self.rollups.fetch_add(1, Ordering::SeqCst);
        Ok(ThreadSummary {
            title: "Rolled".into(),
            summary: items.iter().map(|c| c.summary.as_str()).collect::<Vec<_>>().join(" | "),
            tags: vec!["archive".into()],
            ..ThreadSummary::default()
        })
    }

    fn merge(
        &self,
        _conversation_id: &str,
        parts: &[ThreadSummary],
        _excerpt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ThreadSummary, ProviderError> {
        Ok(ThreadSummary {
            summary: parts.iter().map(|p| p.summary.as_str()).collect::<Vec<_>>().join(" || "),
            tags: vec!["archive".into(), "Archive".into()],
            ..ThreadSummary::default()
        })
    }
}

impl ThreadSentimentRolluper for Scripted {
    fn rollup(
        &self,
        _conversation_id: &str,
        items: &[ChunkSentimentSummary],
        _excerpt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ThreadSentimentSummary, ProviderError> {
        Ok(ThreadSentimentSummary {
            emotional_summary: format!("{} calm chunks", items.len()),
            dominant_emotions: vec!["calm".into()],
            ..ThreadSentimentSummary::default()
        })
    }

    fn merge(
        &self,
        _conversation_id: &str,
        parts: &[ThreadSentimentSummary],
        _excerpt: &str,
        _cancel: &CancellationToken,
    ) -> Result<ThreadSentimentSummary, ProviderError> {
        Ok(ThreadSentimentSummary {
            emotional_summary: format!("{} calm parts", parts.len()),
            ..ThreadSentimentSummary::default()
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A linear conversation with `turns` user/assistant pairs.
fn conversation(id: &str, start: f64, turns: usize) -> serde_json::Value {
    let mut mapping = serde_json::Map::new();
    let mut parent: Option<String> = None;
    for i in 0..turns * 2 {
        let node = format!("{id}-n{i}");
        let role = if i % 2 == 0 { "user" } else { "assistant" };
        mapping.insert(
            node.clone(),
            serde_json::json!({
                "message": {
                    "author": {"role": role},
                    "create_time": start + i as f64,
                    "content": {"content_type": "text", "parts": [format!("{id} {role} {i}")]}
                },
                "parent": parent,
                "children": []
            }),
        );
        parent = Some(node);
    }
    serde_json::json!({
        "conversation_id": id,
        "title": format!("Thread {id}"),
        "create_time": start,
        "mapping": mapping
    })
}

fn write_export(dir: &Path, conversations: &[serde_json::Value]) -> std::path::PathBuf {
    let path = dir.join("conversations.json");
    fs::write(&path, serde_json::to_vec(conversations).unwrap()).unwrap();
    path
}

fn config(dir: &Path, input: std::path::PathBuf) -> PipelineConfig {
    PipelineConfig {
        input: Some(input),
        out_dir: dir.join("out"),
        target_turns_per_chunk: 3,
        concurrency: 2,
        batch_size: 2,
        max_chunks_per_thread: 2,
        glossary_min_count: 0,
        ..PipelineConfig::default()
    }
}

fn pipeline(config: PipelineConfig, scripted: &Arc<Scripted>) -> Pipeline {
    Pipeline::new(config)
        .with_summarizers(scripted.clone(), scripted.clone())
        .with_rollupers(scripted.clone(), Some(scripted.clone()))
}

// ─────────────────────────────────────────────────────────────────────────────
// End-to-End
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_full_pipeline_produces_every_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_export(
        tmp.path(),
        &[conversation("alpha", 1_700_000_000.0, 7), conversation("beta", 1_700_100_000.0, 2)],
    );
    let scripted = Arc::new(Scripted::default());
    let run = pipeline(config(tmp.path(), input), &scripted);

    let report = run.run(&CancellationToken::new()).unwrap();
    let layout = run.layout();

    assert_eq!(report.split.as_ref().map(|s| s.threads_written), Some(2));
    // alpha: 7 turns at 3 per chunk → 3 chunks; beta: 1 chunk.
    assert_eq!(report.chunk.as_ref().map(|c| c.chunk_paths.len()), Some(4));
    assert_eq!(report.summarize.as_ref().map(|s| s.summarized), Some(4));
    assert_eq!(report.rollup.as_ref().map(|r| r.written), Some(2));
    assert!(report.skipped.is_empty());

    assert!(layout.chunks.join("alpha/1700000000_3.json").exists());
    assert!(layout.summaries.join("alpha/1700000000_3.sentiment.summary.json").exists());
    assert!(layout.summaries.join("glossary.json").exists());
    assert_eq!(fs::read_to_string(layout.summaries.join(CHUNK_INDEX_FILE)).unwrap().lines().count(), 4);

    // alpha has 3 chunks with a window of 2: two parts plus a merge.
    assert!(layout.thread_summaries.join("alpha.thread.summary.part02of02.json").exists());
    let alpha: ThreadSummary = serde_json::from_slice(
        &fs::read(layout.thread_summaries.join("alpha.thread.summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(alpha.conversation_id, "alpha");
    assert_eq!(alpha.thread_start, Some(1_700_000_000.0));
    assert_eq!(alpha.summary.matches(" || ").count(), 1);

    let index = fs::read_to_string(layout.thread_summaries.join(THREAD_INDEX_FILE)).unwrap();
    let records: Vec<ThreadIndexRecord> =
        index.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].tags, vec!["archive".to_string()]);
    assert!(layout.thread_sentiment_summaries.join(THREAD_SENTIMENT_INDEX_FILE).exists());
}

#[test]
fn test_rerun_resumes_without_model_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_export(tmp.path(), &[conversation("alpha", 1_700_000_000.0, 4)]);

    let first = Arc::new(Scripted::default());
    pipeline(config(tmp.path(), input.clone()), &first).run(&CancellationToken::new()).unwrap();
    assert!(first.summaries.load(Ordering::SeqCst) > 0);

    let second = Arc::new(Scripted::default());
    let report = pipeline(config(tmp.path(), input), &second).run(&CancellationToken::new()).unwrap();

    assert_eq!(report.skipped, vec![Stage::Split, Stage::Chunk]);
    assert_eq!(report.summarize.as_ref().map(|s| s.summarized), Some(0));
    assert_eq!(report.rollup.as_ref().map(|r| r.skipped), Some(1));
    assert_eq!(second.summaries.load(Ordering::SeqCst), 0);
    assert_eq!(second.rollups.load(Ordering::SeqCst), 0);
}

#[test]
fn test_structural_stages_without_collaborators() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_export(tmp.path(), &[conversation("alpha", 1_700_000_000.0, 2)]);

    let report = Pipeline::new(config(tmp.path(), input)).run(&CancellationToken::new()).unwrap();

    assert_eq!(report.skipped, vec![Stage::Summarize, Stage::Rollup]);
    assert_eq!(report.chunk.map(|c| c.threads_processed), Some(1));
}

#[test]
fn test_only_stage_runs_one_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_export(tmp.path(), &[conversation("alpha", 1_700_000_000.0, 2)]);
    let config = PipelineConfig {
        stages: StageSelection::Only(Stage::Split),
        ..config(tmp.path(), input)
    };

    let run = Pipeline::new(config);
    let report = run.run(&CancellationToken::new()).unwrap();

    assert!(report.split.is_some());
    assert!(report.chunk.is_none());
    assert!(!run.layout().chunks.exists());
}

#[test]
fn test_skip_policy_keeps_good_conversations() {
    let tmp = tempfile::tempdir().unwrap();
    let mut broken = conversation("broken", 1_700_000_000.0, 1);
    broken["conversation_id"] = serde_json::Value::Null;
    let input = write_export(tmp.path(), &[broken, conversation("alpha", 1_700_000_000.0, 1)]);

    let strict = PipelineConfig {
        stages: StageSelection::Only(Stage::Split),
        out_dir: tmp.path().join("strict"),
        ..config(tmp.path(), input.clone())
    };
    let err = Pipeline::new(strict).run(&CancellationToken::new()).unwrap_err();
    assert!(matches!(err, PipelineError::Split(_)));

    let lenient = PipelineConfig {
        stages: StageSelection::Only(Stage::Split),
        on_error: ElementErrorPolicy::Skip,
        out_dir: tmp.path().join("lenient"),
        ..config(tmp.path(), input)
    };
    let report = Pipeline::new(lenient).run(&CancellationToken::new()).unwrap();
    let split = report.split.unwrap();
    assert_eq!(split.threads_written, 1);
    assert_eq!(split.skipped.len(), 1);
    assert_eq!(split.skipped[0].index, 0);
}

#[test]
fn test_cancelled_token_stops_before_first_stage() {
    let tmp = tempfile::tempdir().unwrap();
    let input = write_export(tmp.path(), &[conversation("alpha", 1_700_000_000.0, 1)]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = Pipeline::new(config(tmp.path(), input)).run(&cancel).unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
}
