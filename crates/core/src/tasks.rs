//! Built-in task handlers for the curation step types.
//!
//! Each handler is deterministic and config-driven; the language-model backed
//! variants used in production implement the same [`TaskHandler`] trait and
//! are registered by the host in place of these.

use crate::types::{
    DatasetEntry, DocumentRef, GeneratedQuestion, RunSummary, StepOutput, StepRecord, TextChunk,
};
use crate::workflow::dispatcher::{StepInputs, TaskContext, TaskHandler};
use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Marks the start of a run
pub struct StartHandler;

#[async_trait::async_trait]
impl TaskHandler for StartHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _step: &StepRecord,
        _inputs: &StepInputs,
    ) -> Result<StepOutput> {
        Ok(StepOutput::Started)
    }
}

#[derive(Debug, Deserialize)]
struct DocumentConfig {
    #[serde(default)]
    documents: Vec<DocumentRef>,
}

/// Materializes the step config's source list into document references
pub struct DocumentHandler;

#[async_trait::async_trait]
impl TaskHandler for DocumentHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        step: &StepRecord,
        _inputs: &StepInputs,
    ) -> Result<StepOutput> {
        let config: DocumentConfig = serde_json::from_value(step.config.clone())
            .context("document step config is malformed")?;

        if config.documents.is_empty() {
            bail!("document step has no source documents configured");
        }

        let mut documents = config.documents;
        documents.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(StepOutput::Documents { documents })
    }
}

#[derive(Debug, Deserialize)]
struct ChunkerConfig {
    #[serde(default = "default_max_chars")]
    max_chars: usize,
}

fn default_max_chars() -> usize {
    1200
}

/// Splits upstream documents into bounded-size chunks on paragraph boundaries
pub struct ChunkerHandler;

#[async_trait::async_trait]
impl TaskHandler for ChunkerHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        step: &StepRecord,
        inputs: &StepInputs,
    ) -> Result<StepOutput> {
        let config: ChunkerConfig = serde_json::from_value(step.config.clone())
            .context("chunker step config is malformed")?;
        if config.max_chars == 0 {
            bail!("chunker max_chars must be positive");
        }

        let documents = gather_documents(inputs);
        if documents.is_empty() {
            bail!("chunker expects a documents input from an upstream step");
        }

        let mut chunks = Vec::new();
        for document in &documents {
            for (index, text) in split_text(&document.text, config.max_chars)
                .into_iter()
                .enumerate()
            {
                chunks.push(TextChunk {
                    document: document.name.clone(),
                    index,
                    text,
                });
            }
        }

        Ok(StepOutput::Chunks { chunks })
    }
}

#[derive(Debug, Deserialize)]
struct QuestionConfig {
    #[serde(default = "default_question_template")]
    template: String,
}

fn default_question_template() -> String {
    "What does this passage from {document} describe?".to_string()
}

/// Derives one question per upstream chunk from a configured template
pub struct QuestionHandler;

#[async_trait::async_trait]
impl TaskHandler for QuestionHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        step: &StepRecord,
        inputs: &StepInputs,
    ) -> Result<StepOutput> {
        let config: QuestionConfig = serde_json::from_value(step.config.clone())
            .context("question step config is malformed")?;

        let chunks = gather_chunks(inputs);
        if chunks.is_empty() {
            bail!("question expects a chunks input from an upstream step");
        }

        let questions = chunks
            .into_iter()
            .map(|chunk| GeneratedQuestion {
                question: config.template.replace("{document}", &chunk.document),
                document: chunk.document,
                chunk_index: chunk.index,
                excerpt: chunk.text,
            })
            .collect();

        Ok(StepOutput::Questions { questions })
    }
}

/// Joins upstream questions with their source excerpts into dataset entries
pub struct DatasetHandler;

#[async_trait::async_trait]
impl TaskHandler for DatasetHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _step: &StepRecord,
        inputs: &StepInputs,
    ) -> Result<StepOutput> {
        let questions = gather_questions(inputs);
        if questions.is_empty() {
            bail!("dataset expects a questions input from an upstream step");
        }

        let entries = questions
            .into_iter()
            .map(|question| DatasetEntry {
                question: question.question,
                answer: question.excerpt,
                source_document: question.document,
                chunk_index: question.chunk_index,
            })
            .collect();

        Ok(StepOutput::Dataset { entries })
    }
}

/// Folds every upstream output into a run summary
pub struct EndHandler;

#[async_trait::async_trait]
impl TaskHandler for EndHandler {
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _step: &StepRecord,
        inputs: &StepInputs,
    ) -> Result<StepOutput> {
        let mut summary = RunSummary::default();
        for output in inputs.values() {
            match output {
                StepOutput::Documents { documents } => summary.documents += documents.len(),
                StepOutput::Chunks { chunks } => summary.chunks += chunks.len(),
                StepOutput::Questions { questions } => summary.questions += questions.len(),
                StepOutput::Dataset { entries } => summary.entries += entries.len(),
                StepOutput::Started | StepOutput::Finished { .. } => {}
            }
        }

        Ok(StepOutput::Finished { summary })
    }
}

fn gather_documents(inputs: &StepInputs) -> Vec<DocumentRef> {
    let mut documents: Vec<DocumentRef> = inputs
        .values()
        .filter_map(|output| match output {
            StepOutput::Documents { documents } => Some(documents.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    documents.sort_by(|a, b| a.name.cmp(&b.name));
    documents
}

fn gather_chunks(inputs: &StepInputs) -> Vec<TextChunk> {
    let mut chunks: Vec<TextChunk> = inputs
        .values()
        .filter_map(|output| match output {
            StepOutput::Chunks { chunks } => Some(chunks.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    chunks.sort_by(|a, b| a.document.cmp(&b.document).then(a.index.cmp(&b.index)));
    chunks
}

fn gather_questions(inputs: &StepInputs) -> Vec<GeneratedQuestion> {
    let mut questions: Vec<GeneratedQuestion> = inputs
        .values()
        .filter_map(|output| match output {
            StepOutput::Questions { questions } => Some(questions.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    questions.sort_by(|a, b| {
        a.document
            .cmp(&b.document)
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    questions
}

/// Split text into pieces of at most `max_chars`, preferring paragraph
/// boundaries; a single overlong paragraph is hard-split on char boundaries.
fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        for part in hard_split(paragraph, max_chars) {
            if current.is_empty() {
                current = part;
            } else if current.chars().count() + 2 + part.chars().count() <= max_chars {
                current.push_str("\n\n");
                current.push_str(&part);
            } else {
                pieces.push(std::mem::replace(&mut current, part));
            }
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|window| window.iter().collect())
        .collect()
}
