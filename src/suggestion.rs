//! End-of-set coaching cue selection

use crate::models::{Suggestion, ViolationHistogram, ViolationKind};

pub const CLEAN_SET_CUE: &str = "Good job";
pub const FALLBACK_CUE: &str = "Focus on control and symmetry.";

/// Cue for a violation kind
pub fn cue_for(kind: &ViolationKind) -> &'static str {
    match kind {
        ViolationKind::DepthLow => "Sit deeper; drive through heels.",
        ViolationKind::Valgus => "Push knees out and track toes.",
        ViolationKind::Tempo => "Slow down the eccentric; count 2s.",
        ViolationKind::Other(_) => FALLBACK_CUE,
    }
}

/// Pick the dominant violation and map it to a cue.
///
/// Highest count wins. Ties go to the lower `ViolationKind::priority`, then to
/// the lexically smaller name, so the result never depends on map order.
/// Kinds with a zero count are ignored.
pub fn select(histogram: &ViolationHistogram) -> Suggestion {
    let primary = histogram
        .iter()
        .filter(|(_, count)| **count > 0)
        .min_by(|(a, a_count), (b, b_count)| {
            b_count
                .cmp(a_count)
                .then_with(|| a.priority().cmp(&b.priority()))
                .then_with(|| a.as_str().cmp(b.as_str()))
        })
        .map(|(kind, _)| kind.clone());

    match primary {
        Some(kind) => Suggestion {
            cue: cue_for(&kind).to_string(),
            violation: Some(kind),
        },
        None => Suggestion {
            cue: CLEAN_SET_CUE.to_string(),
            violation: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(entries: &[(ViolationKind, u32)]) -> ViolationHistogram {
        entries.iter().cloned().collect()
    }

    #[test]
    fn test_empty_histogram_is_good_job() {
        let suggestion = select(&ViolationHistogram::new());
        assert_eq!(suggestion.cue, "Good job");
        assert_eq!(suggestion.violation, None);
    }

    #[test]
    fn test_highest_count_wins() {
        let suggestion = select(&histogram(&[
            (ViolationKind::DepthLow, 3),
            (ViolationKind::Valgus, 1),
        ]));
        assert_eq!(suggestion.violation, Some(ViolationKind::DepthLow));
        assert_eq!(suggestion.cue, "Sit deeper; drive through heels.");

        let suggestion = select(&histogram(&[
            (ViolationKind::DepthLow, 1),
            (ViolationKind::Tempo, 4),
        ]));
        assert_eq!(suggestion.violation, Some(ViolationKind::Tempo));
    }

    #[test]
    fn test_ties_follow_priority() {
        let suggestion = select(&histogram(&[
            (ViolationKind::Tempo, 2),
            (ViolationKind::Valgus, 2),
        ]));
        assert_eq!(suggestion.violation, Some(ViolationKind::Valgus));

        let suggestion = select(&histogram(&[
            (ViolationKind::Other("hip_shift".to_string()), 2),
            (ViolationKind::Tempo, 2),
        ]));
        assert_eq!(suggestion.violation, Some(ViolationKind::Tempo));

        let suggestion = select(&histogram(&[
            (ViolationKind::Other("zzz".to_string()), 5),
            (ViolationKind::Other("aaa".to_string()), 5),
        ]));
        assert_eq!(
            suggestion.violation,
            Some(ViolationKind::Other("aaa".to_string()))
        );
    }

    #[test]
    fn test_unknown_kind_gets_fallback_cue() {
        let suggestion = select(&histogram(&[(
            ViolationKind::Other("hip_shift".to_string()),
            1,
        )]));
        assert_eq!(suggestion.cue, FALLBACK_CUE);
        assert_eq!(
            suggestion.violation,
            Some(ViolationKind::Other("hip_shift".to_string()))
        );
    }

    #[test]
    fn test_zero_counts_are_ignored() {
        let suggestion = select(&histogram(&[(ViolationKind::Valgus, 0)]));
        assert_eq!(suggestion.violation, None);
    }
}
