use crate::error::QueryError;
use crate::llm::{CompletionConstraints, LlmClient};
use crate::metrics::PipelineMetrics;
use crate::models::{Citation, Degradation, RetrievedChunk, SubQuery, SynthesizedAnswer};
use regex::Regex;
use std::sync::Arc;

/// Returned without a model call whenever retrieval produced no context.
pub const INSUFFICIENT_EVIDENCE: &str =
    "Insufficient evidence in the indexed corpus to answer this question.";

const SYNTHESIZE_SYSTEM: &str = "You answer scientific questions using only the supplied \
context passages. After every claim, cite the passage it came from with its bracketed id, \
for example [3f9a1c0b44de]. Do not use outside knowledge. If the passages do not contain \
the answer, say so plainly.";

/// Length of the passage ids shown to the model. Long enough that prefixes
/// of sha-256 chunk ids stay unambiguous within one context set.
const MARKER_CHARS: usize = 12;

/// One answer plus the grounding faults tolerated while producing it.
#[derive(Debug)]
pub struct SynthesisOutcome {
    pub answer: SynthesizedAnswer,
    pub degradations: Vec<Degradation>,
}

/// Builds a grounded answer over retrieved context. Every citation marker in
/// the model output is checked against the supplied chunk ids; markers that
/// match nothing are stripped and reported rather than failing the run.
pub struct Synthesizer<L> {
    llm: Arc<L>,
    metrics: Arc<PipelineMetrics>,
}

impl<L: LlmClient> Synthesizer<L> {
    pub fn new(llm: Arc<L>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { llm, metrics }
    }

    pub async fn synthesize(
        &self,
        question: &str,
        sub_queries: &[SubQuery],
        context: &[RetrievedChunk],
    ) -> Result<SynthesisOutcome, QueryError> {
        let context_chunk_ids: Vec<String> =
            context.iter().map(|chunk| chunk.chunk_id.clone()).collect();

        if context.is_empty() {
            return Ok(SynthesisOutcome {
                answer: SynthesizedAnswer {
                    question: question.to_string(),
                    sub_queries: sub_queries.to_vec(),
                    context_chunk_ids,
                    answer_text: INSUFFICIENT_EVIDENCE.to_string(),
                    citations: Vec::new(),
                },
                degradations: vec![Degradation::EmptyContext],
            });
        }

        let constraints = CompletionConstraints {
            max_tokens: Some(1_024),
            temperature: None,
        };

        PipelineMetrics::bump(&self.metrics.llm_calls);
        let completion = self
            .llm
            .complete(SYNTHESIZE_SYSTEM, &build_user_prompt(question, context), &constraints)
            .await
            .map_err(|err| {
                PipelineMetrics::bump(&self.metrics.llm_failures);
                QueryError::Model(err)
            })?;
        if let Some(tokens) = completion.total_tokens {
            PipelineMetrics::add(&self.metrics.llm_tokens, tokens);
        }

        let resolved = resolve_citations(&completion.text, context);
        for degradation in &resolved.degradations {
            if let Degradation::GroundingViolation { marker } = degradation {
                tracing::warn!(marker, "stripped citation to unknown chunk");
            }
        }

        Ok(SynthesisOutcome {
            answer: SynthesizedAnswer {
                question: question.to_string(),
                sub_queries: sub_queries.to_vec(),
                context_chunk_ids,
                answer_text: resolved.text,
                citations: resolved.citations,
            },
            degradations: resolved.degradations,
        })
    }
}

fn marker_for(chunk_id: &str) -> &str {
    chunk_id.get(..MARKER_CHARS).unwrap_or(chunk_id)
}

fn build_user_prompt(question: &str, context: &[RetrievedChunk]) -> String {
    let mut prompt = String::from("Context passages:\n\n");
    for chunk in context {
        prompt.push_str(&format!("[{}] {}\n\n", marker_for(&chunk.chunk_id), chunk.text));
    }
    prompt.push_str(&format!(
        "Question: {question}\n\nAnswer using only the passages above, citing each claim."
    ));
    prompt
}

struct ResolvedCitations {
    text: String,
    citations: Vec<Citation>,
    degradations: Vec<Degradation>,
}

/// Keeps markers that prefix-match exactly one supplied chunk id; any other
/// marker is removed from the text and reported as a grounding violation.
fn resolve_citations(raw: &str, context: &[RetrievedChunk]) -> ResolvedCitations {
    let marker_re = match Regex::new(r"\[([0-9a-f]{6,64})\]") {
        Ok(re) => re,
        Err(_) => {
            return ResolvedCitations {
                text: raw.trim().to_string(),
                citations: Vec::new(),
                degradations: Vec::new(),
            }
        }
    };

    let mut citations: Vec<Citation> = Vec::new();
    let mut violations: Vec<String> = Vec::new();

    let replaced = marker_re.replace_all(raw, |captures: &regex::Captures<'_>| {
        let marker = &captures[1];
        let mut matches = context
            .iter()
            .filter(|chunk| chunk.chunk_id.starts_with(marker));
        match (matches.next(), matches.next()) {
            (Some(chunk), None) => {
                if !citations.iter().any(|citation| citation.marker == marker) {
                    citations.push(Citation {
                        marker: marker.to_string(),
                        chunk_id: chunk.chunk_id.clone(),
                    });
                }
                captures[0].to_string()
            }
            _ => {
                if !violations.contains(&marker.to_string()) {
                    violations.push(marker.to_string());
                }
                String::new()
            }
        }
    });

    let squeeze_re = Regex::new(r"[ \t]{2,}");
    let text = match squeeze_re {
        Ok(re) => re.replace_all(replaced.trim(), " ").into_owned(),
        Err(_) => replaced.trim().to_string(),
    };

    ResolvedCitations {
        text,
        citations,
        degradations: violations
            .into_iter()
            .map(|marker| Degradation::GroundingViolation { marker })
            .collect(),
    }
}
