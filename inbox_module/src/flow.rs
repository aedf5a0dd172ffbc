use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FLOW_STATE_VERSION: u32 = 1;

/// Scripted interaction stored on a conversation. While present, inbound
/// messages answer the flow instead of being routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowState {
    Survey {
        version: u32,
        survey_id: String,
        questions: Vec<String>,
        step: usize,
        answers: Vec<SurveyAnswer>,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyAnswer {
    pub question: String,
    pub answer: String,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep {
    /// Answer recorded; `prompt` is the next question to send.
    Continue { state: FlowState, prompt: String },
    Completed {
        survey_id: String,
        answers: Vec<SurveyAnswer>,
    },
    Aborted { survey_id: String, step: usize },
}

impl FlowState {
    /// Starts a survey and returns it together with the first question.
    /// Returns `None` for an empty question list.
    pub fn start_survey(
        survey_id: impl Into<String>,
        questions: Vec<String>,
        now: DateTime<Utc>,
    ) -> Option<(FlowState, String)> {
        let first = questions.first()?.clone();
        let state = FlowState::Survey {
            version: FLOW_STATE_VERSION,
            survey_id: survey_id.into(),
            questions,
            step: 0,
            answers: Vec::new(),
            started_at: now,
        };
        Some((state, first))
    }

    /// One-line description handed to the reply generator as context.
    pub fn summary(&self) -> String {
        match self {
            FlowState::Survey {
                survey_id,
                questions,
                step,
                ..
            } => format!(
                "survey {} in progress, question {} of {}",
                survey_id,
                (*step + 1).min(questions.len()),
                questions.len()
            ),
        }
    }

    pub fn advance(self, input: &str, exit_keywords: &[String], now: DateTime<Utc>) -> FlowStep {
        match self {
            FlowState::Survey {
                version,
                survey_id,
                questions,
                step,
                mut answers,
                started_at,
            } => {
                if is_exit_keyword(input, exit_keywords) {
                    return FlowStep::Aborted { survey_id, step };
                }
                if let Some(question) = questions.get(step) {
                    answers.push(SurveyAnswer {
                        question: question.clone(),
                        answer: input.trim().to_string(),
                        answered_at: now,
                    });
                }
                let next = step + 1;
                match questions.get(next).cloned() {
                    Some(prompt) => FlowStep::Continue {
                        state: FlowState::Survey {
                            version,
                            survey_id,
                            questions,
                            step: next,
                            answers,
                            started_at,
                        },
                        prompt,
                    },
                    None => FlowStep::Completed { survey_id, answers },
                }
            }
        }
    }
}

pub fn is_exit_keyword(input: &str, exit_keywords: &[String]) -> bool {
    let input = input.trim();
    exit_keywords
        .iter()
        .any(|keyword| keyword.trim().eq_ignore_ascii_case(input))
}
