//! Completion Markers (C4).
//!
//! Pure classifier over an agent's final text: no I/O, no agent-role
//! knowledge beyond the sentinel table in §4.4. Scans with plain substring
//! search rather than a JSON or regex parse, the same texture as the
//! upstream crate's `parse_ralph_completions` bracket scanner in
//! `orchestration.rs`.

use crate::domain::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Planning,
    Coding,
    Testing,
    Review,
}

impl From<Phase> for Role {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Coding => Role::Coding,
            Phase::Testing => Role::Testing,
            Phase::Review => Role::Review,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub ok: bool,
    pub confidence: f32,
    pub reason: String,
}

struct Markers {
    positive: &'static str,
    negatives: &'static [&'static str],
}

fn markers_for(role: Role) -> Markers {
    match role {
        Role::Planning => Markers { positive: "PLANNING_PHASE_COMPLETE", negatives: &["PLANNING_FAILED"] },
        Role::Coding => Markers { positive: "CODING_PHASE_COMPLETE", negatives: &["COMPILATION_FAILED"] },
        Role::Testing => {
            Markers { positive: "TESTING_PHASE_COMPLETE", negatives: &["TESTS_FAILED", "PIPELINE_FAILED"] }
        }
        Role::Review => {
            Markers { positive: "REVIEW_PHASE_COMPLETE", negatives: &["MERGE_BLOCKED", "PIPELINE_FAILED"] }
        }
    }
}

/// Classify an agent's final text per §4.4's priority rules: a failure
/// marker always wins over the positive marker, even when both are present.
pub fn check(role: Role, final_text: &str) -> Completion {
    let markers = markers_for(role);
    let has_positive = final_text.contains(markers.positive);
    let hit_negative = markers.negatives.iter().find(|n| final_text.contains(**n));

    match (has_positive, hit_negative) {
        (_, Some(negative)) => Completion {
            ok: false,
            confidence: if has_positive { 0.5 } else { 1.0 },
            reason: format!("found failure marker {}", negative),
        },
        (true, None) => Completion { ok: true, confidence: 1.0, reason: format!("found {}", markers.positive) },
        (false, None) => Completion {
            ok: false,
            confidence: 1.0,
            reason: format!("neither {} nor a failure marker found", markers.positive),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coding_success_requires_positive_marker_only() {
        let c = check(Role::Coding, "all good\nCODING_PHASE_COMPLETE\n");
        assert!(c.ok);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn coding_failure_marker_wins_even_with_positive_present() {
        let c = check(Role::Coding, "CODING_PHASE_COMPLETE but actually COMPILATION_FAILED");
        assert!(!c.ok);
        assert_eq!(c.confidence, 0.5);
    }

    #[test]
    fn testing_accepts_either_failure_marker() {
        assert!(!check(Role::Testing, "TESTS_FAILED").ok);
        assert!(!check(Role::Testing, "PIPELINE_FAILED").ok);
    }

    #[test]
    fn review_requires_explicit_positive_marker() {
        let c = check(Role::Review, "looks fine to me");
        assert!(!c.ok);
        assert_eq!(c.confidence, 1.0);
    }

    #[test]
    fn review_merge_blocked_is_a_failure() {
        assert!(!check(Role::Review, "REVIEW_PHASE_COMPLETE but MERGE_BLOCKED").ok);
    }
}
