//! The audio-generation job (spec.md §4.5, §8 S5): splits each polished
//! chapter into sentence-sized segments, emits one TTS unit per segment,
//! and once every segment of a chapter has resolved, emits a CPU unit to
//! concatenate the segment audio into a chapter file and record durations
//! for SMIL alignment. The concatenation body itself is out of scope
//! (spec.md §1); this job only produces the opaque CPU work unit.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::context::ServiceContext;
use crate::document_store::Filter;
use crate::jobs::{Job, JobFactory, JobStatusMap};
use crate::model::{Attribution, JobId, ResultPayload, TtsRequest, UnitId, WorkKind, WorkPayload, WorkResult, WorkUnit, WriteOp};

pub const JOB_TYPE: &str = "audio_generation";

/// Hard cap, in Unicode code points, on a single TTS segment (spec.md §8).
pub const MAX_SEGMENT_LEN: usize = 4096;

/// Clause-level fallback punctuation, tried when no sentence boundary
/// (`.`, `!`, `?`) falls inside the current window.
const CLAUSE_PUNCTUATION: [char; 5] = [',', ';', ':', '—', '-'];

enum UnitTag {
    Tts { chapter_id: String, index: usize, text: String },
    Concatenate { chapter_id: String },
}

struct ChapterAudioState {
    total_segments: usize,
    resolved: HashSet<usize>,
    durations_ms: HashMap<usize, u64>,
    concatenation_emitted: bool,
}

pub struct AudioGenerationJob {
    id: JobId,
    book_id: String,
    voice: String,
    tts_provider: Option<String>,
    chapters: HashMap<String, ChapterAudioState>,
    in_flight: HashMap<UnitId, UnitTag>,
}

impl AudioGenerationJob {
    pub fn new(book_id: impl Into<String>, voice: impl Into<String>, tts_provider: Option<String>) -> Self {
        Self {
            id: String::new(),
            book_id: book_id.into(),
            voice: voice.into(),
            tts_provider,
            chapters: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn factory() -> JobFactory {
        std::sync::Arc::new(|id: JobId, metadata: HashMap<String, Value>| {
            let book_id = metadata.get("book_id").and_then(Value::as_str).unwrap_or_default().to_string();
            let voice = metadata.get("voice").and_then(Value::as_str).unwrap_or("default").to_string();
            let tts_provider = metadata.get("tts_provider").and_then(Value::as_str).map(str::to_string);
            let mut job = AudioGenerationJob::new(book_id, voice, tts_provider);
            job.id = id;
            Box::new(job) as Box<dyn Job>
        })
    }

    async fn pending_chapters(&self, ctx: &ServiceContext) -> Vec<Value> {
        let chapters = ctx
            .document_store
            .query("Chapter", &[Filter::eq("book_id", json!(self.book_id))])
            .await
            .unwrap_or_default();

        let mut pending = Vec::new();
        for chapter in chapters {
            if chapter.get("polished") != Some(&json!(true)) {
                continue;
            }
            let Some(id) = chapter.get("id").and_then(Value::as_str) else { continue };
            let has_audio = !ctx
                .document_store
                .query("BookAudio", &[Filter::eq("chapter_id", json!(id))])
                .await
                .unwrap_or_default()
                .is_empty();
            if !has_audio {
                pending.push(chapter);
            }
        }
        pending
    }

    fn tts_unit(&self, chapter_id: &str, index: usize, text: &str) -> WorkUnit {
        let request = TtsRequest { text: text.to_string(), voice: self.voice.clone() };
        let mut unit = WorkUnit::new(self.id.clone(), WorkKind::Tts, WorkPayload::Tts(request)).with_attribution(Attribution {
            book_id: Some(self.book_id.clone()),
            page_id: None,
            stage: Some("audio".to_string()),
            item_key: Some(format!("{chapter_id}:{index}")),
            prompt_key: None,
            prompt_cid: None,
        });
        if let Some(provider) = &self.tts_provider {
            unit = unit.with_provider(provider.clone());
        }
        unit
    }

    fn concatenate_unit(&self, chapter_id: &str, state: &ChapterAudioState) -> WorkUnit {
        let mut durations: Vec<(usize, u64)> = state.durations_ms.iter().map(|(i, d)| (*i, *d)).collect();
        durations.sort_by_key(|(i, _)| *i);
        WorkUnit::new(
            self.id.clone(),
            WorkKind::Cpu,
            WorkPayload::Cpu(json!({ "chapter_id": chapter_id, "segment_durations_ms": durations })),
        )
        .with_attribution(Attribution {
            book_id: Some(self.book_id.clone()),
            page_id: None,
            stage: Some("audio-concatenate".to_string()),
            item_key: Some(chapter_id.to_string()),
            prompt_key: None,
            prompt_cid: None,
        })
    }
}

#[async_trait]
impl Job for AudioGenerationJob {
    fn job_type(&self) -> &'static str {
        JOB_TYPE
    }

    fn set_record_id(&mut self, id: JobId) {
        self.id = id;
    }

    fn record_id(&self) -> JobId {
        self.id.clone()
    }

    fn metadata(&self) -> HashMap<String, Value> {
        let mut meta = HashMap::new();
        meta.insert("book_id".to_string(), json!(self.book_id));
        meta.insert("voice".to_string(), json!(self.voice));
        if let Some(provider) = &self.tts_provider {
            meta.insert("tts_provider".to_string(), json!(provider));
        }
        meta
    }

    async fn start(&mut self, ctx: &ServiceContext) -> Vec<WorkUnit> {
        let mut units = Vec::new();

        for chapter in self.pending_chapters(ctx).await {
            let chapter_id = chapter.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let text = chapter.get("polished_text").and_then(Value::as_str).unwrap_or_default();
            let segments = split_into_segments(text, MAX_SEGMENT_LEN);

            let existing = ctx
                .document_store
                .query("AudioSegment", &[Filter::eq("chapter_id", json!(chapter_id))])
                .await
                .unwrap_or_default();
            let existing_by_index: HashMap<usize, Value> = existing
                .into_iter()
                .filter_map(|e| e.get("index").and_then(Value::as_u64).map(|i| (i as usize, e)))
                .collect();

            let mut state = ChapterAudioState {
                total_segments: segments.len(),
                resolved: HashSet::new(),
                durations_ms: HashMap::new(),
                concatenation_emitted: false,
            };

            for (index, segment_text) in segments.iter().enumerate() {
                match existing_by_index.get(&index).and_then(|e| e.get("duration_ms")).and_then(Value::as_u64) {
                    Some(duration_ms) => {
                        state.resolved.insert(index);
                        state.durations_ms.insert(index, duration_ms);
                    }
                    None => {
                        let unit = self.tts_unit(&chapter_id, index, segment_text);
                        self.in_flight.insert(
                            unit.id.clone(),
                            UnitTag::Tts { chapter_id: chapter_id.clone(), index, text: segment_text.clone() },
                        );
                        units.push(unit);
                    }
                }
            }

            if state.resolved.len() == state.total_segments {
                let unit = self.concatenate_unit(&chapter_id, &state);
                self.in_flight.insert(unit.id.clone(), UnitTag::Concatenate { chapter_id: chapter_id.clone() });
                state.concatenation_emitted = true;
                units.push(unit);
            }

            self.chapters.insert(chapter_id, state);
        }

        units
    }

    async fn on_complete(&mut self, ctx: &ServiceContext, result: WorkResult) -> Vec<WorkUnit> {
        let Some(tag) = self.in_flight.remove(&result.unit_id) else {
            warn!(job_id = %self.id, unit_id = %result.unit_id, "audio-generation job received unknown unit id");
            return vec![];
        };

        if !result.success {
            warn!(job_id = %self.id, unit_id = %result.unit_id, error = ?result.error, "audio-generation unit failed");
        }

        match tag {
            UnitTag::Tts { chapter_id, index, text } => {
                let duration_ms = match &result.payload {
                    ResultPayload::Tts(t) => t.duration_ms,
                    _ => 0,
                };
                ctx.sink
                    .send(WriteOp::create(
                        "AudioSegment",
                        json!({ "chapter_id": chapter_id, "index": index, "text": text, "duration_ms": duration_ms }),
                    ))
                    .await;

                let Some(state) = self.chapters.get_mut(&chapter_id) else { return vec![] };
                state.resolved.insert(index);
                state.durations_ms.insert(index, duration_ms);

                if state.resolved.len() == state.total_segments && !state.concatenation_emitted {
                    let unit = self.concatenate_unit(&chapter_id, state);
                    state.concatenation_emitted = true;
                    self.in_flight.insert(unit.id.clone(), UnitTag::Concatenate { chapter_id });
                    return vec![unit];
                }
                vec![]
            }
            UnitTag::Concatenate { chapter_id } => {
                if let ResultPayload::Cpu(value) = &result.payload {
                    ctx.sink
                        .send(WriteOp::create(
                            "BookAudio",
                            json!({ "book_id": self.book_id, "chapter_id": chapter_id, "assembly": value }),
                        ))
                        .await;
                }
                self.chapters.remove(&chapter_id);
                vec![]
            }
        }
    }

    fn done(&self) -> bool {
        self.chapters.is_empty()
    }

    fn status(&self) -> JobStatusMap {
        let mut map = JobStatusMap::new();
        map.insert("book_id".to_string(), json!(self.book_id));
        map.insert("chapters_remaining".to_string(), json!(self.chapters.len()));
        map
    }
}

/// Splits `text` into segments of at most `max_len` Unicode code points.
/// Prefers a sentence boundary (`.`, `!`, `?`) nearest the cap; failing
/// that, a clause boundary (`,`, `;`, `:`, `—`, `-`); failing that, cuts at
/// the hard code-point bound. Concatenating the returned segments recovers
/// the input up to surrounding-whitespace normalization.
pub fn split_into_segments(text: &str, max_len: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![];
    }

    let mut segments = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let window_end = (start + max_len).min(chars.len());
        if window_end == chars.len() {
            push_segment(&mut segments, &chars[start..window_end]);
            break;
        }

        let window = &chars[start..window_end];
        let cut = find_sentence_boundary(window)
            .or_else(|| find_clause_boundary(window))
            .unwrap_or(window.len())
            .max(1);

        push_segment(&mut segments, &chars[start..start + cut]);
        start += cut;
    }

    segments
}

fn find_sentence_boundary(window: &[char]) -> Option<usize> {
    window.iter().rposition(|c| matches!(c, '.' | '!' | '?')).map(|i| i + 1)
}

fn find_clause_boundary(window: &[char]) -> Option<usize> {
    window.iter().rposition(|c| CLAUSE_PUNCTUATION.contains(c)).map(|i| i + 1)
}

fn push_segment(segments: &mut Vec<String>, chars: &[char]) {
    let trimmed: String = chars.iter().collect::<String>().trim().to_string();
    if !trimmed.is_empty() {
        segments.push(trimmed);
    }
}
