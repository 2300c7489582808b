use crate::config::DecompositionOptions;
use crate::error::QueryError;
use crate::llm::{CompletionConstraints, LlmClient};
use crate::metrics::PipelineMetrics;
use crate::models::SubQuery;
use regex::Regex;
use std::sync::Arc;
use uuid::Uuid;

const DECOMPOSE_SYSTEM: &str = "You split complex scientific questions into independent \
sub-questions for passage retrieval. Each sub-question must be short, self-contained, and \
answerable from a single passage. Respond with a JSON array of strings and nothing else.";

/// Breaks a complex question into a bounded list of atomic sub-queries via
/// a constrained model call. Output that cannot be coerced into the bounds
/// is an error; the orchestrator decides whether to fall back.
pub struct QueryDecomposer<L> {
    llm: Arc<L>,
    options: DecompositionOptions,
    metrics: Arc<PipelineMetrics>,
}

impl<L: LlmClient> QueryDecomposer<L> {
    pub fn new(llm: Arc<L>, options: DecompositionOptions, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            llm,
            options,
            metrics,
        }
    }

    pub async fn decompose(
        &self,
        question: &str,
        parent_question_id: Uuid,
    ) -> Result<Vec<SubQuery>, QueryError> {
        let constraints = CompletionConstraints {
            max_tokens: Some(400),
            temperature: Some(0.0),
        };

        PipelineMetrics::bump(&self.metrics.llm_calls);
        let completion = self
            .llm
            .complete(DECOMPOSE_SYSTEM, &self.user_prompt(question), &constraints)
            .await
            .map_err(|err| {
                PipelineMetrics::bump(&self.metrics.llm_failures);
                QueryError::Model(err)
            })?;
        if let Some(tokens) = completion.total_tokens {
            PipelineMetrics::add(&self.metrics.llm_tokens, tokens);
        }

        let texts: Vec<String> = parse_subqueries(&completion.text)
            .ok_or_else(|| {
                QueryError::Decomposition(
                    "model output is neither a JSON array nor a numbered list".to_string(),
                )
            })?
            .into_iter()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();

        if texts.len() < self.options.min_subqueries || texts.len() > self.options.max_subqueries {
            return Err(QueryError::Decomposition(format!(
                "{} sub-queries outside [{}, {}]",
                texts.len(),
                self.options.min_subqueries,
                self.options.max_subqueries
            )));
        }
        if texts
            .iter()
            .any(|text| text.chars().count() > self.options.max_subquery_chars)
        {
            return Err(QueryError::Decomposition(format!(
                "a sub-query exceeds {} characters",
                self.options.max_subquery_chars
            )));
        }

        Ok(texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| SubQuery {
                text,
                parent_question_id,
                index,
            })
            .collect())
    }

    fn user_prompt(&self, question: &str) -> String {
        format!(
            "Break this question into {} to {} atomic sub-questions. Respond with a JSON array \
             of strings only.\n\nQuestion: {question}",
            self.options.min_subqueries, self.options.max_subqueries
        )
    }
}

/// Accepts a JSON array anywhere in the output; falls back to numbered or
/// bulleted lines for models that ignore the format instruction.
fn parse_subqueries(raw: &str) -> Option<Vec<String>> {
    if let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']')) {
        if start < end {
            if let Ok(items) = serde_json::from_str::<Vec<String>>(&raw[start..=end]) {
                return Some(items);
            }
        }
    }

    let line_re = Regex::new(r"^\s*(?:\d+[.)]\s*|[-*]\s*)(.+)$").ok()?;
    let lines: Vec<String> = raw
        .lines()
        .filter_map(|line| {
            line_re
                .captures(line)
                .map(|captures| captures[1].trim().to_string())
        })
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines)
    }
}
