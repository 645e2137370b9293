use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::NotFoundError;

pub type SetId = i64;
pub type ExerciseId = i64;
pub type WorkoutId = i64;

/// Category of form error detected on a rep.
///
/// Wire names match the exercise catalog (`depth_low`, `valgus`, `tempo`).
/// Names written by other producers survive a storage round-trip as `Other`;
/// they carry no comparator and are never emitted by the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViolationKind {
    /// Rep did not reach the required depth
    DepthLow,
    /// Knee drifted medially past the allowed angle
    Valgus,
    /// Eccentric phase was rushed
    Tempo,
    Other(String),
}

impl ViolationKind {
    pub fn as_str(&self) -> &str {
        match self {
            ViolationKind::DepthLow => "depth_low",
            ViolationKind::Valgus => "valgus",
            ViolationKind::Tempo => "tempo",
            ViolationKind::Other(name) => name,
        }
    }

    /// Score deducted each time this kind fires on a rep
    pub fn penalty(&self) -> f64 {
        match self {
            ViolationKind::DepthLow => 0.10,
            ViolationKind::Valgus => 0.10,
            ViolationKind::Tempo => 0.05,
            ViolationKind::Other(_) => 0.0,
        }
    }

    /// Tie-break rank when two kinds share the top count; lower wins.
    ///
    /// depth_low < valgus < tempo < any other kind. Unknown kinds tie here and
    /// are then ordered by name.
    pub fn priority(&self) -> u8 {
        match self {
            ViolationKind::DepthLow => 0,
            ViolationKind::Valgus => 1,
            ViolationKind::Tempo => 2,
            ViolationKind::Other(_) => 3,
        }
    }
}

impl From<&str> for ViolationKind {
    fn from(s: &str) -> Self {
        match s {
            "depth_low" => ViolationKind::DepthLow,
            "valgus" => ViolationKind::Valgus,
            "tempo" => ViolationKind::Tempo,
            other => ViolationKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ViolationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ViolationKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ViolationKind::from(name.as_str()))
    }
}

/// Occurrence count per violation kind across a set
pub type ViolationHistogram = BTreeMap<ViolationKind, u32>;

/// A threshold rule, one variant per violation kind.
///
/// Each variant names the metric it reads and how it compares: depth and
/// valgus fire above a maximum, tempo fires below a minimum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rule {
    DepthLow { max_knee_angle: f64 },
    Valgus { max_valgus_deg: f64 },
    Tempo { min_eccentric_s: f64 },
}

impl Rule {
    pub const DEFAULT_MAX_KNEE_ANGLE: f64 = 95.0;
    pub const DEFAULT_MAX_VALGUS_DEG: f64 = 5.0;
    pub const DEFAULT_MIN_ECCENTRIC_S: f64 = 1.5;

    pub fn kind(&self) -> ViolationKind {
        match self {
            Rule::DepthLow { .. } => ViolationKind::DepthLow,
            Rule::Valgus { .. } => ViolationKind::Valgus,
            Rule::Tempo { .. } => ViolationKind::Tempo,
        }
    }

    /// Name of the rep metric this rule is evaluated against
    pub fn metric(&self) -> &'static str {
        match self {
            Rule::DepthLow { .. } => "knee_angle_min",
            Rule::Valgus { .. } => "knee_valgus_deg",
            Rule::Tempo { .. } => "tempo_s",
        }
    }

    /// Field name of the threshold inside the catalog descriptor
    pub fn threshold_key(&self) -> &'static str {
        match self {
            Rule::DepthLow { .. } => "max_knee_angle",
            Rule::Valgus { .. } => "max_valgus_deg",
            Rule::Tempo { .. } => "min_eccentric_s",
        }
    }

    pub fn threshold(&self) -> f64 {
        match *self {
            Rule::DepthLow { max_knee_angle } => max_knee_angle,
            Rule::Valgus { max_valgus_deg } => max_valgus_deg,
            Rule::Tempo { min_eccentric_s } => min_eccentric_s,
        }
    }

    pub fn is_violated(&self, value: f64) -> bool {
        match *self {
            Rule::DepthLow { max_knee_angle } => value > max_knee_angle,
            Rule::Valgus { max_valgus_deg } => value > max_valgus_deg,
            Rule::Tempo { min_eccentric_s } => value < min_eccentric_s,
        }
    }

    /// Rule with the default threshold for `kind`, if the kind has a comparator
    pub fn default_for(kind: &ViolationKind) -> Option<Rule> {
        match kind {
            ViolationKind::DepthLow => Some(Rule::DepthLow {
                max_knee_angle: Self::DEFAULT_MAX_KNEE_ANGLE,
            }),
            ViolationKind::Valgus => Some(Rule::Valgus {
                max_valgus_deg: Self::DEFAULT_MAX_VALGUS_DEG,
            }),
            ViolationKind::Tempo => Some(Rule::Tempo {
                min_eccentric_s: Self::DEFAULT_MIN_ECCENTRIC_S,
            }),
            ViolationKind::Other(_) => None,
        }
    }

    fn with_threshold(self, value: f64) -> Rule {
        match self {
            Rule::DepthLow { .. } => Rule::DepthLow { max_knee_angle: value },
            Rule::Valgus { .. } => Rule::Valgus { max_valgus_deg: value },
            Rule::Tempo { .. } => Rule::Tempo { min_eccentric_s: value },
        }
    }
}

/// Per-exercise rule thresholds, read-only once loaded for a set.
///
/// Serialized as `{"depth_low": {"max_knee_angle": 95}, "tempo": {...}}`.
/// A descriptor without its threshold key falls back to the kind's default;
/// unknown kinds are dropped because nothing can evaluate them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRuleConfig", into = "RawRuleConfig")]
pub struct RuleConfig {
    rules: BTreeMap<ViolationKind, Rule>,
}

impl RuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.insert(rule);
        self
    }

    pub fn insert(&mut self, rule: Rule) {
        self.rules.insert(rule.kind(), rule);
    }

    pub fn get(&self, kind: &ViolationKind) -> Option<&Rule> {
        self.rules.get(kind)
    }

    /// Rules in priority order
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct RawRuleConfig(BTreeMap<String, BTreeMap<String, RawThreshold>>);

/// Threshold as written in a catalog. TOML can spell `nan` and `inf`, so
/// numbers are kept as `f64` and checked rather than routed through JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawThreshold {
    Number(f64),
    Other(serde_json::Value),
}

impl TryFrom<RawRuleConfig> for RuleConfig {
    type Error = String;

    fn try_from(raw: RawRuleConfig) -> Result<Self, Self::Error> {
        let mut config = RuleConfig::new();

        for (name, descriptor) in raw.0 {
            let kind = ViolationKind::from(name.as_str());
            let Some(default_rule) = Rule::default_for(&kind) else {
                tracing::warn!(kind = %name, "Ignoring rule with no comparator");
                continue;
            };

            let rule = match descriptor.get(default_rule.threshold_key()) {
                None | Some(RawThreshold::Other(serde_json::Value::Null)) => default_rule,
                Some(RawThreshold::Number(threshold)) if threshold.is_finite() => {
                    default_rule.with_threshold(*threshold)
                }
                Some(_) => {
                    return Err(format!(
                        "rule '{}' threshold '{}' must be a finite number",
                        name,
                        default_rule.threshold_key()
                    ))
                }
            };

            config.insert(rule);
        }

        Ok(config)
    }
}

impl From<RuleConfig> for RawRuleConfig {
    fn from(config: RuleConfig) -> Self {
        let raw = config
            .rules
            .into_iter()
            .map(|(kind, rule)| {
                let mut descriptor = BTreeMap::new();
                descriptor.insert(
                    rule.threshold_key().to_string(),
                    RawThreshold::Number(rule.threshold()),
                );
                (kind.as_str().to_string(), descriptor)
            })
            .collect();
        RawRuleConfig(raw)
    }
}

/// One rep's measured values, keyed by metric name.
///
/// Any named numeric field is accepted; `null` entries count as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, serde_json::Value>")]
pub struct RepMetrics(BTreeMap<String, f64>);

impl RepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<BTreeMap<String, serde_json::Value>> for RepMetrics {
    type Error = String;

    fn try_from(raw: BTreeMap<String, serde_json::Value>) -> Result<Self, Self::Error> {
        let mut metrics = BTreeMap::new();
        for (name, value) in raw {
            match value {
                serde_json::Value::Null => continue,
                serde_json::Value::Number(n) => {
                    let v = n
                        .as_f64()
                        .filter(|v| v.is_finite())
                        .ok_or_else(|| format!("metric '{}' is not a finite number", name))?;
                    metrics.insert(name, v);
                }
                _ => return Err(format!("metric '{}' must be a number", name)),
            }
        }
        Ok(RepMetrics(metrics))
    }
}

impl FromIterator<(String, f64)> for RepMetrics {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        RepMetrics(iter.into_iter().collect())
    }
}

/// Quality of a single rep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepScore {
    /// In [0, 1]
    pub score: f64,
    /// Kinds triggered on this rep, in priority order
    pub violations: Vec<ViolationKind>,
}

impl RepScore {
    pub fn perfect() -> Self {
        Self {
            score: 1.0,
            violations: Vec::new(),
        }
    }
}

/// Coaching cue chosen when a set ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub cue: String,
    /// Dominant violation, `None` when the set was clean
    pub violation: Option<ViolationKind>,
}

/// Exercise catalog record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: ExerciseId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_muscle: Option<String>,
    /// `None` when the catalog has no thresholds for this exercise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<RuleConfig>,
}

/// Lifecycle state of a training set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetStatus {
    /// Accepting reps
    Active,
    /// Terminal; read-only
    Finalized,
}

impl SetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetStatus::Active => "active",
            SetStatus::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SetStatus::Active),
            "finalized" => Some(SetStatus::Finalized),
            _ => None,
        }
    }
}

/// A set that has been built but not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewSet {
    pub workout_id: WorkoutId,
    pub exercise_id: ExerciseId,
    pub set_no: i64,
    pub expected_reps: i64,
    /// Snapshot of the exercise's rules at start time
    pub rules: Option<RuleConfig>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedRep {
    /// Client-supplied label; not used for ordering or deduplication
    pub rep_index: i64,
    pub metrics: RepMetrics,
    pub score: f64,
    pub violations: Vec<ViolationKind>,
    pub recorded_at: DateTime<Utc>,
}

/// One training set and its running aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetState {
    pub set_id: SetId,
    pub workout_id: WorkoutId,
    pub exercise_id: ExerciseId,
    pub set_no: i64,
    pub expected_reps: i64,
    pub rules: Option<RuleConfig>,
    pub status: SetStatus,
    /// Append-only, in arrival order
    pub reps: Vec<RecordedRep>,
    pub score_sum: f64,
    pub rep_count: u32,
    pub histogram: ViolationHistogram,
    pub suggestion: Option<Suggestion>,
    /// Bumped on every mutation; used for compare-and-swap saves
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl SetState {
    /// Promote a freshly persisted set to Active
    pub fn activate(set_id: SetId, new_set: NewSet) -> Self {
        Self {
            set_id,
            workout_id: new_set.workout_id,
            exercise_id: new_set.exercise_id,
            set_no: new_set.set_no,
            expected_reps: new_set.expected_reps,
            rules: new_set.rules,
            status: SetStatus::Active,
            reps: Vec::new(),
            score_sum: 0.0,
            rep_count: 0,
            histogram: ViolationHistogram::new(),
            suggestion: None,
            version: 0,
            created_at: new_set.created_at,
            updated_at: new_set.created_at,
            finalized_at: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status == SetStatus::Finalized
    }

    /// Exact mean of all folded scores, `None` before the first rep
    pub fn mean_score(&self) -> Option<f64> {
        if self.rep_count == 0 {
            None
        } else {
            Some(self.score_sum / self.rep_count as f64)
        }
    }

    /// Fold one scored rep into the aggregate
    pub fn apply_rep(
        &mut self,
        rep_index: i64,
        metrics: RepMetrics,
        score: &RepScore,
        at: DateTime<Utc>,
    ) -> Result<(), NotFoundError> {
        if self.is_finalized() {
            return Err(NotFoundError::SetFinalized {
                set_id: self.set_id,
            });
        }

        for kind in &score.violations {
            *self.histogram.entry(kind.clone()).or_insert(0) += 1;
        }
        self.reps.push(RecordedRep {
            rep_index,
            metrics,
            score: score.score,
            violations: score.violations.clone(),
            recorded_at: at,
        });
        self.score_sum += score.score;
        self.rep_count += 1;
        self.version += 1;
        self.updated_at = at;
        Ok(())
    }

    /// Close the set; no reps are accepted afterwards
    pub fn finalize(&mut self, suggestion: Suggestion, at: DateTime<Utc>) {
        self.status = SetStatus::Finalized;
        self.suggestion = Some(suggestion);
        self.finalized_at = Some(at);
        self.version += 1;
        self.updated_at = at;
    }
}

/// Liveness summary used by janitors to find abandoned sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetActivity {
    pub set_id: SetId,
    pub workout_id: WorkoutId,
    pub exercise_id: ExerciseId,
    pub rep_count: u32,
    pub updated_at: DateTime<Utc>,
}
