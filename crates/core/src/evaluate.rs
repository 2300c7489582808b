use crate::config::EvaluationOptions;
use crate::llm::{CompletionConstraints, LlmClient};
use crate::metrics::PipelineMetrics;
use crate::models::{Degradation, RetrievedChunk, SynthesizedAnswer};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

const JUDGE_SYSTEM: &str = "You are a strict evaluator of question-answering systems. Respond \
with a JSON object {\"score\": <number between 0 and 1>, \"rationale\": \"<one sentence>\"} \
and nothing else.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    RetrievalPrecision,
    Faithfulness,
    AnswerRelevance,
    AnswerCorrectness,
}

impl MetricKind {
    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::RetrievalPrecision => "retrieval_precision",
            MetricKind::Faithfulness => "faithfulness",
            MetricKind::AnswerRelevance => "answer_relevance",
            MetricKind::AnswerCorrectness => "answer_correctness",
        }
    }
}

/// One judged metric. `value` is `None` when the judge call failed or its
/// output carried no usable number; such metrics drop out of the composite.
#[derive(Debug, Clone, Serialize)]
pub struct MetricScore {
    pub metric: MetricKind,
    pub value: Option<f64>,
    pub rationale: Option<String>,
    pub clamped: bool,
}

/// Scores for one answered question. `composite` is the weighted mean over
/// the usable metrics, renormalized when correctness is absent or a judge
/// failed; `None` only when no metric produced a value.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub scores: Vec<MetricScore>,
    pub composite: Option<f64>,
    pub degradations: Vec<Degradation>,
}

/// Model-as-judge scoring of answer quality: retrieval precision,
/// faithfulness, answer relevance, and (gold answer permitting) correctness.
/// Judges run concurrently; a misbehaving judge flags its metric instead of
/// failing the evaluation.
pub struct Evaluator<L> {
    llm: Arc<L>,
    options: EvaluationOptions,
    metrics: Arc<PipelineMetrics>,
}

impl<L: LlmClient> Evaluator<L> {
    pub fn new(llm: Arc<L>, options: EvaluationOptions, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            llm,
            options,
            metrics,
        }
    }

    pub async fn evaluate(
        &self,
        answer: &SynthesizedAnswer,
        context: &[RetrievedChunk],
        gold_answer: Option<&str>,
    ) -> EvaluationReport {
        let mut tasks = vec![
            self.judge_one(
                MetricKind::RetrievalPrecision,
                precision_prompt(&answer.question, context),
            ),
            self.judge_one(
                MetricKind::Faithfulness,
                faithfulness_prompt(&answer.answer_text, context),
            ),
            self.judge_one(
                MetricKind::AnswerRelevance,
                relevance_prompt(&answer.question, &answer.answer_text),
            ),
        ];
        if let Some(gold) = gold_answer {
            tasks.push(self.judge_one(
                MetricKind::AnswerCorrectness,
                correctness_prompt(&answer.answer_text, gold),
            ));
        }

        let mut scores = Vec::with_capacity(tasks.len());
        let mut degradations = Vec::new();
        for (score, degradation) in futures::future::join_all(tasks).await {
            scores.push(score);
            degradations.extend(degradation);
        }

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for score in &scores {
            if let Some(value) = score.value {
                let weight = self.weight(score.metric);
                weighted += weight * value;
                total_weight += weight;
            }
        }
        let composite = (total_weight > 0.0).then(|| weighted / total_weight);

        EvaluationReport {
            scores,
            composite,
            degradations,
        }
    }

    fn weight(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::RetrievalPrecision => self.options.precision_weight,
            MetricKind::Faithfulness => self.options.faithfulness_weight,
            MetricKind::AnswerRelevance => self.options.relevance_weight,
            MetricKind::AnswerCorrectness => self.options.correctness_weight,
        }
    }

    async fn judge_one(
        &self,
        metric: MetricKind,
        user: String,
    ) -> (MetricScore, Option<Degradation>) {
        let constraints = CompletionConstraints {
            max_tokens: Some(200),
            temperature: Some(0.0),
        };

        PipelineMetrics::bump(&self.metrics.judge_calls);
        let raw = match self.llm.complete(JUDGE_SYSTEM, &user, &constraints).await {
            Ok(completion) => {
                if let Some(tokens) = completion.total_tokens {
                    PipelineMetrics::add(&self.metrics.llm_tokens, tokens);
                }
                completion.text
            }
            Err(err) => {
                PipelineMetrics::bump(&self.metrics.judge_parse_failures);
                return (
                    MetricScore {
                        metric,
                        value: None,
                        rationale: None,
                        clamped: false,
                    },
                    Some(Degradation::JudgeUnparseable {
                        metric: metric.label().to_string(),
                        reason: err.to_string(),
                    }),
                );
            }
        };

        match parse_judgment(&raw) {
            Ok((score, rationale)) if (0.0..=1.0).contains(&score) => (
                MetricScore {
                    metric,
                    value: Some(score),
                    rationale,
                    clamped: false,
                },
                None,
            ),
            Ok((score, rationale)) => {
                tracing::warn!(metric = metric.label(), score, "judge score out of range");
                (
                    MetricScore {
                        metric,
                        value: Some(score.clamp(0.0, 1.0)),
                        rationale,
                        clamped: true,
                    },
                    Some(Degradation::JudgeClamped {
                        metric: metric.label().to_string(),
                        raw: score,
                    }),
                )
            }
            Err(reason) => {
                PipelineMetrics::bump(&self.metrics.judge_parse_failures);
                (
                    MetricScore {
                        metric,
                        value: None,
                        rationale: None,
                        clamped: false,
                    },
                    Some(Degradation::JudgeUnparseable {
                        metric: metric.label().to_string(),
                        reason,
                    }),
                )
            }
        }
    }
}

fn passages(context: &[RetrievedChunk]) -> String {
    let mut joined = String::new();
    for chunk in context {
        joined.push_str(&format!("- {}\n", chunk.text));
    }
    joined
}

fn precision_prompt(question: &str, context: &[RetrievedChunk]) -> String {
    format!(
        "Question: {question}\n\nRetrieved passages:\n{}\nScore how many of the retrieved \
         passages are relevant to the question, as a fraction between 0 and 1.",
        passages(context)
    )
}

fn faithfulness_prompt(answer: &str, context: &[RetrievedChunk]) -> String {
    format!(
        "Passages:\n{}\nAnswer: {answer}\n\nScore what fraction of the answer's claims are \
         supported by the passages, between 0 and 1.",
        passages(context)
    )
}

fn relevance_prompt(question: &str, answer: &str) -> String {
    format!(
        "Question: {question}\n\nAnswer: {answer}\n\nScore how well the answer directly \
         addresses the question, between 0 and 1."
    )
}

fn correctness_prompt(answer: &str, gold: &str) -> String {
    format!(
        "Gold answer: {gold}\n\nCandidate answer: {answer}\n\nScore how well the candidate \
         agrees with the gold answer, between 0 and 1."
    )
}

/// Extracts the score from judge output: a JSON object first, then the
/// first bare number for judges that ignore the format instruction.
fn parse_judgment(raw: &str) -> Result<(f64, Option<String>), String> {
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&raw[start..=end]) {
                if let Some(score) = value.pointer("/score").and_then(Value::as_f64) {
                    let rationale = value
                        .pointer("/rationale")
                        .and_then(Value::as_str)
                        .map(|text| text.to_string());
                    return Ok((score, rationale));
                }
            }
        }
    }

    let float_re = Regex::new(r"-?\d+(?:\.\d+)?").map_err(|err| err.to_string())?;
    if let Some(found) = float_re.find(raw) {
        if let Ok(score) = found.as_str().parse::<f64>() {
            return Ok((score, None));
        }
    }

    Err(format!(
        "no numeric score in judge output: {}",
        raw.chars().take(80).collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::llm::Completion;
    use async_trait::async_trait;

    /// Routes judge prompts to scripted replies by matching a phrase unique
    /// to each metric's prompt. Prompts with no route fail the call.
    struct RouterLlm {
        routes: Vec<(&'static str, String)>,
    }

    #[async_trait]
    impl LlmClient for RouterLlm {
        async fn complete(
            &self,
            _system: &str,
            user: &str,
            _constraints: &CompletionConstraints,
        ) -> Result<Completion, ModelError> {
            for (needle, reply) in &self.routes {
                if user.contains(needle) {
                    return Ok(Completion {
                        text: reply.clone(),
                        total_tokens: Some(3),
                    });
                }
            }
            Err(ModelError::Empty {
                service: "judge".to_string(),
            })
        }
    }

    fn answer() -> SynthesizedAnswer {
        SynthesizedAnswer {
            question: "What limits CRISPR efficiency?".to_string(),
            sub_queries: Vec::new(),
            context_chunk_ids: vec!["aaa".to_string()],
            answer_text: "Delivery efficiency and off-target effects [aaa].".to_string(),
            citations: Vec::new(),
        }
    }

    fn context() -> Vec<RetrievedChunk> {
        vec![RetrievedChunk {
            chunk_id: "aaa".to_string(),
            text: "Delivery remains the main constraint.".to_string(),
            score: 0.8,
            hit_by: vec![0],
        }]
    }

    fn judged(routes: Vec<(&'static str, String)>) -> Evaluator<RouterLlm> {
        Evaluator::new(
            Arc::new(RouterLlm { routes }),
            EvaluationOptions::default(),
            Arc::new(PipelineMetrics::new()),
        )
    }

    fn score_reply(score: f64) -> String {
        format!("{{\"score\": {score}, \"rationale\": \"ok\"}}")
    }

    #[tokio::test]
    async fn composite_is_the_mean_of_all_four_with_gold() {
        let evaluator = judged(vec![
            ("passages are relevant", score_reply(0.8)),
            ("supported by the passages", score_reply(0.6)),
            ("directly addresses the question", score_reply(1.0)),
            ("agrees with the gold answer", score_reply(0.4)),
        ]);

        let report = evaluator
            .evaluate(&answer(), &context(), Some("Delivery and off-target effects."))
            .await;

        assert_eq!(report.scores.len(), 4);
        assert!((report.composite.unwrap() - 0.7).abs() < 1e-9);
        assert!(report.degradations.is_empty());
    }

    #[tokio::test]
    async fn missing_gold_excludes_correctness_and_renormalizes() {
        let evaluator = judged(vec![
            ("passages are relevant", score_reply(0.8)),
            ("supported by the passages", score_reply(0.6)),
            ("directly addresses the question", score_reply(1.0)),
        ]);

        let report = evaluator.evaluate(&answer(), &context(), None).await;

        assert_eq!(report.scores.len(), 3);
        assert!(report
            .scores
            .iter()
            .all(|score| score.metric != MetricKind::AnswerCorrectness));
        assert!((report.composite.unwrap() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn out_of_range_scores_are_clamped_and_flagged() {
        let evaluator = judged(vec![
            ("passages are relevant", score_reply(1.7)),
            ("supported by the passages", score_reply(0.5)),
            ("directly addresses the question", score_reply(0.5)),
        ]);

        let report = evaluator.evaluate(&answer(), &context(), None).await;

        let precision = report
            .scores
            .iter()
            .find(|score| score.metric == MetricKind::RetrievalPrecision)
            .unwrap();
        assert_eq!(precision.value, Some(1.0));
        assert!(precision.clamped);
        assert!(report
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::JudgeClamped { raw, .. } if (*raw - 1.7).abs() < 1e-9)));
        let composite = report.composite.unwrap();
        assert!((0.0..=1.0).contains(&composite));
    }

    #[tokio::test]
    async fn unparseable_judge_drops_out_of_the_composite() {
        let metrics = Arc::new(PipelineMetrics::new());
        let evaluator = Evaluator::new(
            Arc::new(RouterLlm {
                routes: vec![
                    ("passages are relevant", score_reply(0.9)),
                    (
                        "supported by the passages",
                        "the answer seems mostly fine".to_string(),
                    ),
                    ("directly addresses the question", score_reply(0.7)),
                ],
            }),
            EvaluationOptions::default(),
            Arc::clone(&metrics),
        );

        let report = evaluator.evaluate(&answer(), &context(), None).await;

        let faithfulness = report
            .scores
            .iter()
            .find(|score| score.metric == MetricKind::Faithfulness)
            .unwrap();
        assert_eq!(faithfulness.value, None);
        assert!((report.composite.unwrap() - 0.8).abs() < 1e-9);
        assert!(report
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::JudgeUnparseable { .. })));
        assert_eq!(metrics.snapshot().judge_parse_failures, 1);
    }

    #[tokio::test]
    async fn failed_judge_call_is_flagged_not_fatal() {
        // No route for faithfulness, so that call errors outright.
        let evaluator = judged(vec![
            ("passages are relevant", score_reply(1.0)),
            ("directly addresses the question", score_reply(0.5)),
        ]);

        let report = evaluator.evaluate(&answer(), &context(), None).await;

        assert!((report.composite.unwrap() - 0.75).abs() < 1e-9);
        assert!(report
            .degradations
            .iter()
            .any(|d| matches!(d, Degradation::JudgeUnparseable { .. })));
    }

    #[tokio::test]
    async fn bare_number_replies_are_accepted() {
        assert_eq!(parse_judgment("0.75"), Ok((0.75, None)));
        assert_eq!(
            parse_judgment("Score: 0.4 because the answer is partial"),
            Ok((0.4, None))
        );
        assert!(parse_judgment("no verdict").is_err());
    }

    #[tokio::test]
    async fn weights_bias_the_composite() {
        let evaluator = Evaluator::new(
            Arc::new(RouterLlm {
                routes: vec![
                    ("passages are relevant", score_reply(1.0)),
                    ("supported by the passages", score_reply(0.0)),
                    ("directly addresses the question", score_reply(0.0)),
                ],
            }),
            EvaluationOptions {
                precision_weight: 3.0,
                faithfulness_weight: 1.0,
                relevance_weight: 1.0,
                correctness_weight: 1.0,
            },
            Arc::new(PipelineMetrics::new()),
        );

        let report = evaluator.evaluate(&answer(), &context(), None).await;
        assert!((report.composite.unwrap() - 0.6).abs() < 1e-9);
    }
}
