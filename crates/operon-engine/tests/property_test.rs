//! Property-based validation of the engine's pure decision logic.
//!
//! Exercises the state machine, backoff schedule, and progress math over
//! generated inputs, checking the invariants the rest of the engine leans
//! on rather than enumerating cases by hand.

use std::time::Duration;

use chrono::Utc;
use operon_core::{is_valid_transition, Operation, OperationState, SessionId, Tier};
use operon_engine::retry::{RetryDecision, RetryPolicy};
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = OperationState> {
    prop_oneof![
        Just(OperationState::Initialized),
        Just(OperationState::Generating),
        Just(OperationState::PartCompleted),
        Just(OperationState::Failed),
        Just(OperationState::Paused),
        Just(OperationState::Cancelled),
        Just(OperationState::Completed),
    ]
}

fn any_tier() -> impl Strategy<Value = Tier> {
    prop_oneof![Just(Tier::Low), Just(Tier::Mid), Just(Tier::High)]
}

fn any_policy() -> impl Strategy<Value = RetryPolicy> {
    (1u32..=10, 1u64..=600, 1u64..=4).prop_map(|(max_retries, base_secs, cap_multiplier)| {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(base_secs),
            max_delay: Duration::from_secs(base_secs * 8 * cap_multiplier),
        }
    })
}

proptest! {
    #[test]
    fn terminal_states_admit_no_successor(from in any_state(), to in any_state()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    #[test]
    fn self_transitions_are_never_valid(state in any_state()) {
        prop_assert!(!state.can_transition_to(state));
    }

    #[test]
    fn typed_and_string_checks_agree(from in any_state(), to in any_state()) {
        prop_assert_eq!(
            from.can_transition_to(to),
            is_valid_transition(&from.to_string(), &to.to_string())
        );
    }

    #[test]
    fn unknown_state_names_are_always_invalid(
        from in any_state(),
        bogus in "[a-z_]{1,20}"
    ) {
        prop_assume!(OperationState::from_str_name(&bogus).is_none());
        prop_assert!(!is_valid_transition(&from.to_string(), &bogus));
        prop_assert!(!is_valid_transition(&bogus, &from.to_string()));
    }

    #[test]
    fn every_valid_transition_leaves_a_terminal_reachable(from in any_state()) {
        // No non-terminal state is a dead end: cancellation or progress is
        // always available.
        if !from.is_terminal() {
            prop_assert!(from.can_transition_to(OperationState::Cancelled));
        }
    }

    #[test]
    fn backoff_is_monotone_and_capped(policy in any_policy(), retry in 1u32..=30) {
        let delay = policy.backoff_delay(retry);
        let next = policy.backoff_delay(retry + 1);

        prop_assert!(next >= delay);
        prop_assert!(delay <= policy.max_delay);
        prop_assert!(delay >= std::cmp::min(policy.base_delay, policy.max_delay));
    }

    #[test]
    fn backoff_matches_closed_form(policy in any_policy(), retry in 1u32..=16) {
        let expected = std::cmp::min(
            policy.base_delay.saturating_mul(2u32.saturating_pow(retry - 1)),
            policy.max_delay,
        );
        prop_assert_eq!(policy.backoff_delay(retry), expected);
    }

    #[test]
    fn decision_gives_up_exactly_at_max_retries(policy in any_policy(), retry in 1u32..=30) {
        let decision = policy.decide(retry, Utc::now());
        if retry >= policy.max_retries {
            prop_assert!(matches!(decision, RetryDecision::GiveUp { .. }), "expected GiveUp");
        } else {
            prop_assert!(matches!(decision, RetryDecision::Retry { .. }), "expected Retry");
        }
    }

    #[test]
    fn scheduled_retry_is_never_in_the_past(policy in any_policy(), retry in 1u32..=30) {
        let failed_at = Utc::now();
        if let RetryDecision::Retry { next_attempt_at } = policy.decide(retry, failed_at) {
            prop_assert!(next_attempt_at >= failed_at);
        }
    }

    #[test]
    fn progress_stays_within_bounds(tier in any_tier(), completed in 0i32..=6) {
        let mut operation = Operation::new(SessionId::from("prop-sess"), tier, Utc::now());
        prop_assume!(completed <= operation.total_parts);
        operation.completed_parts = completed;

        let percent = operation.progress_percent();
        prop_assert!(percent <= 100);
        if completed == 0 {
            prop_assert_eq!(percent, 0);
        }
        if completed == operation.total_parts {
            prop_assert_eq!(percent, 100);
        }
    }

    #[test]
    fn estimated_completion_never_precedes_now(tier in any_tier(), completed in 0i32..=6) {
        let now = Utc::now();
        let mut operation = Operation::new(SessionId::from("prop-sess"), tier, now);
        prop_assume!(completed <= operation.total_parts);
        operation.completed_parts = completed;

        prop_assert!(operation.estimate_completion(now) >= now);
    }
}

/// Helper mirroring `FromStr` without the error payload, for assumptions.
trait FromStrName: Sized {
    fn from_str_name(s: &str) -> Option<Self>;
}

impl FromStrName for OperationState {
    fn from_str_name(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}
