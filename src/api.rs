//! JSON request/response contract for the set endpoints
//!
//! Each call is parsed and validated before it reaches the aggregator, so a
//! malformed payload never mutates state. Failures come back as a uniform
//! `{"error": "..."}` envelope tagged with an [`ErrorCategory`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::aggregator::SetAggregator;
use crate::error::{ErrorCategory, ErrorSeverity, RepCoachError, Result};
use crate::models::{
    ExerciseId, RepMetrics, RuleConfig, SetId, Suggestion, ViolationHistogram, ViolationKind,
    WorkoutId,
};

/// Endpoints served by [`RepCoachService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartSet,
    RecordRep,
    EndSet,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::StartSet => "start-set",
            Operation::RecordRep => "record-rep",
            Operation::EndSet => "end-set",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "start-set" => Ok(Operation::StartSet),
            "record-rep" | "rep" => Ok(Operation::RecordRep),
            "end-set" => Ok(Operation::EndSet),
            _ => Err(format!("Unknown operation: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSetRequest {
    pub workout_id: WorkoutId,
    pub exercise_id: ExerciseId,
    pub set_no: i64,
    pub expected_reps: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRepRequest {
    pub set_id: SetId,
    pub rep_index: i64,
    #[serde(default)]
    pub exercise_id: Option<ExerciseId>,
    pub metrics: RepMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSetRequest {
    pub set_id: SetId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    pub rules: RuleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSetResponse {
    pub ok: bool,
    pub set_id: SetId,
    pub targets: Targets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBody {
    pub value: f64,
    pub violations: Vec<ViolationKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRepResponse {
    pub ok: bool,
    pub score: ScoreBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSummary {
    pub rep_count: u32,
    pub mean_score: Option<f64>,
    pub histogram: ViolationHistogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndSetResponse {
    pub ok: bool,
    pub suggestion: Suggestion,
    pub summary: SetSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
}

/// Transport-agnostic reply: a JSON body plus, on failure, its category
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub category: Option<ErrorCategory>,
    pub body: Value,
}

impl ApiResponse {
    fn success(body: Value) -> Self {
        Self {
            category: None,
            body,
        }
    }

    fn failure(err: &RepCoachError) -> Self {
        let envelope = ErrorEnvelope {
            error: err.to_string(),
        };
        Self {
            category: Some(err.category()),
            body: serde_json::json!(envelope),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.category.is_none()
    }

    pub fn status_code(&self) -> u16 {
        self.category.map(|c| c.status_code()).unwrap_or(200)
    }
}

/// Request dispatcher in front of a [`SetAggregator`]
pub struct RepCoachService {
    aggregator: SetAggregator,
}

impl RepCoachService {
    pub fn new(aggregator: SetAggregator) -> Self {
        Self { aggregator }
    }

    pub fn aggregator(&self) -> &SetAggregator {
        &self.aggregator
    }

    /// Handle a raw JSON request body
    pub fn handle_json(&self, operation: Operation, raw: &str) -> ApiResponse {
        match serde_json::from_str::<Value>(raw) {
            Ok(payload) => self.handle(operation, &payload),
            Err(err) => {
                warn!(%operation, error = %err, "Rejected unparseable request body");
                ApiResponse::failure(&RepCoachError::Validation(err.to_string()))
            }
        }
    }

    pub fn handle(&self, operation: Operation, payload: &Value) -> ApiResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("api_call", %request_id, %operation);
        let _enter = span.enter();

        match self.dispatch(operation, payload) {
            Ok(body) => {
                info!("Request completed");
                ApiResponse::success(body)
            }
            Err(err) => {
                match err.severity() {
                    ErrorSeverity::Critical | ErrorSeverity::Error => {
                        error!(error = %err, category = ?err.category(), "Request failed")
                    }
                    ErrorSeverity::Warning => {
                        warn!(error = %err, category = ?err.category(), "Request rejected")
                    }
                }
                ApiResponse::failure(&err)
            }
        }
    }

    fn dispatch(&self, operation: Operation, payload: &Value) -> Result<Value> {
        match operation {
            Operation::StartSet => {
                let req: StartSetRequest = serde_json::from_value(payload.clone())?;
                let started = self.aggregator.start_set(
                    req.workout_id,
                    req.exercise_id,
                    req.set_no,
                    req.expected_reps,
                )?;
                encode(&StartSetResponse {
                    ok: true,
                    set_id: started.set.set_id,
                    targets: Targets {
                        rules: started.rules.unwrap_or_default(),
                    },
                })
            }
            Operation::RecordRep => {
                let req: RecordRepRequest = serde_json::from_value(payload.clone())?;
                let score = self.aggregator.record_rep(
                    req.set_id,
                    req.rep_index,
                    req.exercise_id,
                    req.metrics,
                )?;
                encode(&RecordRepResponse {
                    ok: true,
                    score: ScoreBody {
                        value: score.score,
                        violations: score.violations,
                    },
                })
            }
            Operation::EndSet => {
                let req: EndSetRequest = serde_json::from_value(payload.clone())?;
                let finalized = self.aggregator.end_set(req.set_id)?;
                encode(&EndSetResponse {
                    ok: true,
                    suggestion: finalized.suggestion,
                    summary: SetSummary {
                        rep_count: finalized.set.rep_count,
                        mean_score: finalized.set.mean_score(),
                        histogram: finalized.set.histogram,
                    },
                })
            }
        }
    }
}

fn encode<T: Serialize>(response: &T) -> Result<Value> {
    serde_json::to_value(response).map_err(|e| RepCoachError::Internal(e.to_string()))
}
