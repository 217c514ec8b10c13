use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::challenge::ChallengeSpec;
use crate::config::{ApiProvider, Config};
use crate::error::ForgeError;
use crate::logger::Logger;
use crate::persist::write_atomic;
use crate::shell::{check_flag, INTERRUPTED};

pub(crate) const HINT_PENALTY: f64 = 0.5;
const JOURNAL_LIMIT: usize = 3000;
const DIFF_LIMIT: usize = 5000;
const MAX_TOKENS: u32 = 1024;

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub(crate) const DIMENSIONS: [&str; 5] = [
    "correctness",
    "approach",
    "code_quality",
    "edge_cases",
    "thinking_depth",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DimensionScores {
    pub(crate) correctness: u8,
    pub(crate) approach: u8,
    pub(crate) code_quality: u8,
    pub(crate) edge_cases: u8,
    pub(crate) thinking_depth: u8,
}

impl DimensionScores {
    /// Validates user-entered scores in `DIMENSIONS` order.
    pub(crate) fn from_manual(values: [i64; 5]) -> Result<Self, ForgeError> {
        let mut checked = [0u8; 5];
        for (slot, (dimension, value)) in checked.iter_mut().zip(DIMENSIONS.into_iter().zip(values)) {
            if !(1..=10).contains(&value) {
                return Err(ForgeError::InvalidScore { dimension, value });
            }
            *slot = value as u8;
        }
        Ok(Self::from_array(checked))
    }

    fn from_array(values: [u8; 5]) -> Self {
        Self {
            correctness: values[0],
            approach: values[1],
            code_quality: values[2],
            edge_cases: values[3],
            thinking_depth: values[4],
        }
    }

    pub(crate) fn values(&self) -> [u8; 5] {
        [
            self.correctness,
            self.approach,
            self.code_quality,
            self.edge_cases,
            self.thinking_depth,
        ]
    }

    pub(crate) fn named(&self) -> impl Iterator<Item = (&'static str, u8)> {
        DIMENSIONS.into_iter().zip(self.values())
    }

    pub(crate) fn mean(&self) -> f64 {
        self.values().iter().map(|value| f64::from(*value)).sum::<f64>() / 5.0
    }
}

pub(crate) fn hint_penalty(hints: u32) -> f64 {
    HINT_PENALTY * f64::from(hints)
}

/// `max(0, mean - 0.5 * hints)`
pub(crate) fn final_score(scores: &DimensionScores, hints: u32) -> f64 {
    (scores.mean() - hint_penalty(hints)).max(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ReviewResult {
    pub(crate) scores: DimensionScores,
    #[serde(default)]
    pub(crate) rationale: Option<String>,
    pub(crate) hints_consumed: u32,
    pub(crate) penalty: f64,
    pub(crate) final_score: f64,
    pub(crate) source: String,
    pub(crate) reviewed_at: DateTime<Utc>,
}

impl ReviewResult {
    pub(crate) fn new(
        scores: DimensionScores,
        rationale: Option<String>,
        hints_consumed: u32,
        source: &str,
    ) -> Self {
        Self {
            scores,
            rationale: rationale.filter(|text| !text.trim().is_empty()),
            hints_consumed,
            penalty: hint_penalty(hints_consumed),
            final_score: final_score(&scores, hints_consumed),
            source: source.to_string(),
            reviewed_at: Utc::now(),
        }
    }
}

/// Everything a reviewer sees about one attempt.
#[derive(Debug, Clone)]
pub(crate) struct ReviewPayload {
    pub(crate) challenge_id: String,
    pub(crate) title: String,
    pub(crate) difficulty: String,
    pub(crate) repo: String,
    pub(crate) description: String,
    pub(crate) journal: String,
    pub(crate) user_diff: String,
    pub(crate) solution_diff: String,
    pub(crate) hints_consumed: u32,
    pub(crate) hints_available: usize,
    pub(crate) test_passed: Option<bool>,
}

impl ReviewPayload {
    pub(crate) fn new(
        spec: &ChallengeSpec,
        journal: &str,
        user_diff: &str,
        solution_diff: &str,
        hints_consumed: u32,
        test_passed: Option<bool>,
    ) -> Self {
        Self {
            challenge_id: spec.id.clone(),
            title: spec.title.clone(),
            difficulty: spec.difficulty.to_string(),
            repo: spec.repo.clone(),
            description: spec.description.trim().to_string(),
            journal: truncate_chars(journal.trim(), JOURNAL_LIMIT),
            user_diff: truncate_chars(user_diff, DIFF_LIMIT),
            solution_diff: truncate_chars(solution_diff, DIFF_LIMIT),
            hints_consumed,
            hints_available: spec.hints.len(),
            test_passed,
        }
    }

    fn test_summary(&self) -> &'static str {
        match self.test_passed {
            Some(true) => "passed",
            Some(false) => "failed",
            None => "not run",
        }
    }

    fn context_sections(&self) -> String {
        format!(
            "## Challenge\n{title} ({id}, {difficulty}, {repo})\n\n{description}\n\n\
             ## Thinking journal\n```\n{journal}\n```\n\n\
             ## Submitted change\n```diff\n{user_diff}\n```\n\n\
             ## Reference solution\n```diff\n{solution_diff}\n```\n\n\
             Hints used: {hints} of {available}. Tests: {tests}.\n",
            title = self.title,
            id = self.challenge_id,
            difficulty = self.difficulty,
            repo = self.repo,
            description = self.description,
            journal = self.journal,
            user_diff = self.user_diff.trim_end(),
            solution_diff = self.solution_diff.trim_end(),
            hints = self.hints_consumed,
            available = self.hints_available,
            tests = self.test_summary(),
        )
    }

    /// Prompt sent to a scoring backend.
    pub(crate) fn render_prompt(&self) -> String {
        format!(
            "You are a senior code reviewer grading a bug-fix practice attempt. \
             Compare the submitted change with the reference solution and read the journal.\n\n\
             {context}\n\
             Score each dimension from 1 to 10:\n\
             1. correctness: does the change fix the bug?\n\
             2. approach: how close is the reasoning to the reference fix?\n\
             3. code_quality: style, readability, idiom.\n\
             4. edge_cases: are boundary conditions handled?\n\
             5. thinking_depth: depth and accuracy of the journal.\n\n\
             Reply with only this JSON object:\n\
             {{\"correctness\": <1-10>, \"approach\": <1-10>, \"code_quality\": <1-10>, \
             \"edge_cases\": <1-10>, \"thinking_depth\": <1-10>, \"rationale\": \"<short assessment>\"}}\n",
            context = self.context_sections(),
        )
    }

    /// Markdown export for pasting into any assistant.
    pub(crate) fn render_export(&self) -> String {
        format!(
            "# Review request: {title}\n\n\
             Paste everything below into an AI assistant, then record the scores with:\n\n\
             ```\nforge review --id {id} --score --correctness N --approach N --code-quality N --edge-cases N --thinking-depth N\n```\n\n\
             ---\n\n{prompt}",
            title = self.title,
            id = self.challenge_id,
            prompt = self.render_prompt(),
        )
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}\n... (truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BackendVerdict {
    pub(crate) scores: DimensionScores,
    pub(crate) rationale: Option<String>,
}

/// A scoring capability selected from configuration.
pub(crate) trait ReviewBackend {
    fn name(&self) -> &str;
    fn score(&self, prompt: &str) -> Result<BackendVerdict, ForgeError>;
}

/// Used when no provider is configured; always defers to export mode.
pub(crate) struct ExportOnly {
    reason: String,
}

impl ExportOnly {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl ReviewBackend for ExportOnly {
    fn name(&self) -> &str {
        "export"
    }

    fn score(&self, _prompt: &str) -> Result<BackendVerdict, ForgeError> {
        Err(ForgeError::ReviewBackendUnavailable(self.reason.clone()))
    }
}

fn http_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    ureq::Agent::new_with_config(config)
}

fn unavailable(provider: &str, what: &str, err: impl std::fmt::Display) -> ForgeError {
    ForgeError::ReviewBackendUnavailable(format!("{} {}: {}", provider, what, err))
}

pub(crate) struct AnthropicBackend {
    api_key: String,
    model: String,
    agent: ureq::Agent,
}

impl AnthropicBackend {
    pub(crate) fn new(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            agent: http_agent(timeout),
        }
    }
}

impl ReviewBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn score(&self, prompt: &str) -> Result<BackendVerdict, ForgeError> {
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });
        let mut response = self
            .agent
            .post(ANTHROPIC_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .send_json(&body)
            .map_err(|err| unavailable("anthropic", "request failed", err))?;
        let value: Value = response
            .body_mut()
            .read_json()
            .map_err(|err| unavailable("anthropic", "response unreadable", err))?;
        let text = value
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| unavailable("anthropic", "response", "missing content text"))?;
        parse_review_response(text)
    }
}

/// OpenAI-compatible `chat/completions` endpoint (OpenAI, OpenRouter).
pub(crate) struct ChatCompletionsBackend {
    provider: ApiProvider,
    url: &'static str,
    api_key: String,
    model: String,
    extra_headers: Vec<(&'static str, &'static str)>,
    agent: ureq::Agent,
}

impl ChatCompletionsBackend {
    pub(crate) fn openai(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            provider: ApiProvider::OpenAi,
            url: OPENAI_URL,
            api_key: api_key.to_string(),
            model: model.to_string(),
            extra_headers: Vec::new(),
            agent: http_agent(timeout),
        }
    }

    pub(crate) fn openrouter(api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            provider: ApiProvider::OpenRouter,
            url: OPENROUTER_URL,
            api_key: api_key.to_string(),
            model: model.to_string(),
            extra_headers: vec![("X-Title", "codeforge")],
            agent: http_agent(timeout),
        }
    }
}

impl ReviewBackend for ChatCompletionsBackend {
    fn name(&self) -> &str {
        self.provider.as_str()
    }

    fn score(&self, prompt: &str) -> Result<BackendVerdict, ForgeError> {
        let provider = self.provider.as_str();
        let body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": prompt}],
        });
        let mut request = self
            .agent
            .post(self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        for (name, value) in &self.extra_headers {
            request = request.header(*name, *value);
        }
        let mut response = request
            .send_json(&body)
            .map_err(|err| unavailable(provider, "request failed", err))?;
        let value: Value = response
            .body_mut()
            .read_json()
            .map_err(|err| unavailable(provider, "response unreadable", err))?;
        let text = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| unavailable(provider, "response", "missing message content"))?;
        parse_review_response(text)
    }
}

/// Picks the backend for the configured provider; anything incomplete
/// falls back to export mode.
pub(crate) fn select_backend(config: &Config) -> Box<dyn ReviewBackend> {
    let Some(provider) = config.api_provider else {
        return Box::new(ExportOnly::new("no api_provider configured"));
    };
    let Some(api_key) = config
        .api_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
    else {
        return Box::new(ExportOnly::new(format!(
            "api_key is not set for provider {}",
            provider
        )));
    };
    let model = config
        .effective_model()
        .unwrap_or_else(|| provider.default_model().to_string());
    let timeout = Duration::from_secs(config.review_timeout_secs);
    match provider {
        ApiProvider::Anthropic => Box::new(AnthropicBackend::new(api_key, &model, timeout)),
        ApiProvider::OpenAi => Box::new(ChatCompletionsBackend::openai(api_key, &model, timeout)),
        ApiProvider::OpenRouter => {
            Box::new(ChatCompletionsBackend::openrouter(api_key, &model, timeout))
        }
    }
}

/// Extracts the first flat JSON object from a model reply.
pub(crate) fn parse_review_response(text: &str) -> Result<BackendVerdict, ForgeError> {
    let pattern = Regex::new(r"\{[^{}]*\}")
        .map_err(|err| ForgeError::ReviewBackendUnavailable(format!("bad pattern: {}", err)))?;
    let candidate = pattern.find(text).ok_or_else(|| {
        ForgeError::ReviewBackendUnavailable("reply contained no JSON object".to_string())
    })?;
    let value: Value = serde_json::from_str(candidate.as_str()).map_err(|err| {
        ForgeError::ReviewBackendUnavailable(format!("reply JSON did not parse: {}", err))
    })?;

    let score = |keys: &[&str]| -> Result<u8, ForgeError> {
        let raw = keys
            .iter()
            .find_map(|key| value.get(*key))
            .ok_or_else(|| {
                ForgeError::ReviewBackendUnavailable(format!("reply has no {} score", keys[0]))
            })?;
        clamp_score(raw).ok_or_else(|| {
            ForgeError::ReviewBackendUnavailable(format!(
                "reply {} score is not a number: {}",
                keys[0], raw
            ))
        })
    };
    let scores = DimensionScores {
        correctness: score(&["correctness"])?,
        approach: score(&["approach"])?,
        code_quality: score(&["code_quality"])?,
        edge_cases: score(&["edge_cases"])?,
        thinking_depth: score(&["thinking_depth", "thinking_quality"])?,
    };
    let rationale = ["rationale", "feedback"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    Ok(BackendVerdict { scores, rationale })
}

/// Numbers and numeric strings clamp to 1..=10.
fn clamp_score(value: &Value) -> Option<u8> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number
        .is_finite()
        .then(|| number.trunc().clamp(1.0, 10.0) as u8)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ReviewOutcome {
    Scored(ReviewResult),
    Exported { path: PathBuf, reason: String },
}

/// Dispatches the payload to `backend`; any backend failure (or a forced
/// export) writes the export artifact instead. A Ctrl-C during the call
/// discards its result.
pub(crate) fn request_review(
    payload: &ReviewPayload,
    backend: &dyn ReviewBackend,
    force_export: bool,
    export_path: &Path,
    logger: &Logger,
) -> Result<ReviewOutcome, ForgeError> {
    dispatch_review(payload, backend, force_export, export_path, &INTERRUPTED, logger)
}

fn dispatch_review(
    payload: &ReviewPayload,
    backend: &dyn ReviewBackend,
    force_export: bool,
    export_path: &Path,
    interrupted: &AtomicBool,
    logger: &Logger,
) -> Result<ReviewOutcome, ForgeError> {
    let reason = if force_export {
        "export requested".to_string()
    } else {
        logger.log(&format!(
            "review dispatch challenge={} backend={}",
            payload.challenge_id,
            backend.name()
        ));
        let reply = backend.score(&payload.render_prompt());
        check_flag(interrupted)?;
        match reply {
            Ok(verdict) => {
                let result = ReviewResult::new(
                    verdict.scores,
                    verdict.rationale,
                    payload.hints_consumed,
                    backend.name(),
                );
                return Ok(ReviewOutcome::Scored(result));
            }
            Err(ForgeError::ReviewBackendUnavailable(reason)) => reason,
            Err(err) => return Err(err),
        }
    };
    logger.log(&format!(
        "review export challenge={} reason={}",
        payload.challenge_id, reason
    ));
    write_atomic(export_path, payload.render_export().as_bytes())?;
    Ok(ReviewOutcome::Exported {
        path: export_path.to_path_buf(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{ChallengeSetup, Difficulty};
    use tempfile::TempDir;

    struct Canned(Result<BackendVerdict, String>);

    impl ReviewBackend for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        fn score(&self, _prompt: &str) -> Result<BackendVerdict, ForgeError> {
            self.0
                .clone()
                .map_err(ForgeError::ReviewBackendUnavailable)
        }
    }

    fn payload(hints: u32) -> ReviewPayload {
        let spec = ChallengeSpec {
            id: "demo-001".to_string(),
            title: "Off-by-one".to_string(),
            repo: "octo/widgets".to_string(),
            difficulty: Difficulty::Easy,
            time_limit: 30,
            description: "Page two repeats an item.".to_string(),
            setup: ChallengeSetup {
                base_commit: "a".to_string(),
                solution_commit: "b".to_string(),
                test_command: String::new(),
                files_of_interest: Vec::new(),
            },
            tags: Vec::new(),
            hints: vec!["one".to_string(), "two".to_string()],
        };
        ReviewPayload::new(&spec, "journal text", "+fix", "+fix", hints, Some(true))
    }

    fn scores(value: u8) -> DimensionScores {
        DimensionScores::from_array([value; 5])
    }

    #[test]
    fn three_hints_on_mean_eight_gives_six_and_a_half() {
        assert_eq!(final_score(&scores(8), 3), 6.5);
        let result = ReviewResult::new(scores(8), None, 3, "manual");
        assert_eq!(result.penalty, 1.5);
        assert_eq!(result.final_score, 6.5);
    }

    #[test]
    fn penalty_is_monotonic_and_floored() {
        let mut previous = f64::MAX;
        for hints in 0..30 {
            let current = final_score(&scores(4), hints);
            assert!(current <= previous);
            assert!(current >= 0.0);
            previous = current;
        }
        assert_eq!(final_score(&scores(1), 10), 0.0);
    }

    #[test]
    fn manual_scores_are_range_checked() {
        let ok = DimensionScores::from_manual([7, 8, 9, 6, 5]).expect("valid");
        assert_eq!(ok.mean(), 7.0);
        let err = DimensionScores::from_manual([7, 8, 11, 6, 5]).expect_err("out of range");
        assert!(matches!(
            err,
            ForgeError::InvalidScore { dimension: "code_quality", value: 11 }
        ));
    }

    #[test]
    fn parses_fenced_reply_with_alias_and_clamping() {
        let reply = "Here you go:\n```json\n{\"correctness\": 12, \"approach\": \"7\", \
                     \"code_quality\": 0, \"edge_cases\": 6.8, \"thinking_quality\": 9, \
                     \"feedback\": \"Solid fix.\"}\n```";
        let verdict = parse_review_response(reply).expect("parse");
        assert_eq!(verdict.scores.values(), [10, 7, 1, 6, 9]);
        assert_eq!(verdict.rationale.as_deref(), Some("Solid fix."));
    }

    #[test]
    fn reply_without_json_is_unavailable() {
        let err = parse_review_response("I cannot grade this.").expect_err("no json");
        assert!(matches!(err, ForgeError::ReviewBackendUnavailable(_)));
    }

    #[test]
    fn reply_missing_a_dimension_is_unavailable() {
        let reply = r#"{"correctness": 8, "approach": 7, "code_quality": 7, "edge_cases": 6}"#;
        match parse_review_response(reply) {
            Err(ForgeError::ReviewBackendUnavailable(reason)) => {
                assert!(reason.contains("thinking_depth"), "{reason}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let worded = r#"{"correctness": "great", "approach": 7, "code_quality": 7,
                        "edge_cases": 6, "thinking_depth": 8}"#;
        assert!(matches!(
            parse_review_response(worded),
            Err(ForgeError::ReviewBackendUnavailable(_))
        ));
    }

    #[test]
    fn payload_truncates_long_inputs() {
        let long = "x".repeat(DIFF_LIMIT + 10);
        let truncated = truncate_chars(&long, DIFF_LIMIT);
        assert!(truncated.ends_with("... (truncated)"));
        assert_eq!(truncate_chars("short", DIFF_LIMIT), "short");
        let prompt = payload(1).render_prompt();
        assert!(prompt.contains("Hints used: 1 of 2. Tests: passed."));
        assert!(prompt.contains("thinking_depth"));
    }

    #[test]
    fn failing_backend_falls_back_to_export() {
        let temp = TempDir::new().expect("temp dir");
        let export = temp.path().join("submission").join("review_export.md");
        let backend = Canned(Err("connection refused".to_string()));
        let outcome =
            request_review(&payload(0), &backend, false, &export, &Logger::discard())
                .expect("review");
        match outcome {
            ReviewOutcome::Exported { path, reason } => {
                assert_eq!(path, export);
                assert_eq!(reason, "connection refused");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let text = std::fs::read_to_string(&export).expect("export written");
        assert!(text.contains("forge review --id demo-001 --score"));
        assert!(text.contains("## Reference solution"));
    }

    #[test]
    fn working_backend_scores_with_penalty() {
        let temp = TempDir::new().expect("temp dir");
        let backend = Canned(Ok(BackendVerdict {
            scores: scores(8),
            rationale: Some("good".to_string()),
        }));
        let outcome = request_review(
            &payload(3),
            &backend,
            false,
            &temp.path().join("export.md"),
            &Logger::discard(),
        )
        .expect("review");
        match outcome {
            ReviewOutcome::Scored(result) => {
                assert_eq!(result.final_score, 6.5);
                assert_eq!(result.source, "canned");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!temp.path().join("export.md").exists());
    }

    #[test]
    fn interrupt_during_backend_call_discards_the_scores() {
        let temp = TempDir::new().expect("temp dir");
        let export = temp.path().join("export.md");
        let backend = Canned(Ok(BackendVerdict {
            scores: scores(8),
            rationale: None,
        }));
        let interrupted = AtomicBool::new(true);
        let err = dispatch_review(
            &payload(0),
            &backend,
            false,
            &export,
            &interrupted,
            &Logger::discard(),
        )
        .expect_err("interrupted");
        assert!(matches!(err, ForgeError::Interrupted));
        assert!(!export.exists());
    }

    #[test]
    fn unconfigured_provider_selects_export_backend() {
        let backend = select_backend(&Config::default());
        assert_eq!(backend.name(), "export");
        let mut config = Config::default();
        config.api_provider = Some(ApiProvider::OpenRouter);
        assert_eq!(select_backend(&config).name(), "export");
        config.api_key = Some("sk-or-123456789".to_string());
        assert_eq!(select_backend(&config).name(), "openrouter");
    }
}
