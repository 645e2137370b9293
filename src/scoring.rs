//! Per-rep quality scoring against an exercise's rule thresholds

use crate::models::{RepMetrics, RepScore, RuleConfig};

/// Score one rep.
///
/// Without rules every rep is perfect. With rules, each rule whose metric is
/// present is checked; a rule whose metric is missing is skipped rather than
/// penalized. The score is `1 - sum(penalties)`, floored at zero.
pub fn evaluate(metrics: &RepMetrics, rules: Option<&RuleConfig>) -> RepScore {
    let Some(rules) = rules else {
        return RepScore::perfect();
    };

    let mut penalty = 0.0;
    let mut violations = Vec::new();

    for rule in rules.iter() {
        let Some(value) = metrics.get(rule.metric()) else {
            continue;
        };

        if rule.is_violated(value) {
            let kind = rule.kind();
            penalty += kind.penalty();
            violations.push(kind);
        }
    }

    RepScore {
        score: (1.0 - penalty).max(0.0),
        violations,
    }
}
