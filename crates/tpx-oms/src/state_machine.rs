//! Order lifecycle state machine.
//!
//! # Design
//!
//! Pure transition logic for a single order. Every lifecycle event goes
//! through [`transition`], which enforces:
//!
//! 1. **Legal transitions only.** Illegal events return
//!    [`TransitionError`]; callers MUST treat this as an inconsistency
//!    requiring investigation, not a recoverable condition.
//! 2. **Monotonicity.** No event moves an order out of a terminal state —
//!    with one deliberate exception, fill precedence (below).
//!
//! # State diagram
//!
//! ```text
//!  New ──SubmitStarted──► Submitting ──SubmitAcked──► Submitted
//!                             │  │
//!               SubmitRejected│  │SubmitFailed
//!                             ▼  ▼
//!                       Rejected  Failed            (terminal)
//!
//!  Submitted ──Fill──► PartiallyFilled ──Fill──► Filled   (terminal)
//!      │                     │
//!      │ CancelAcked         │ CancelAcked
//!      ▼                     ▼
//!  Cancelled ◄───────────────┘                    (terminal)
//!      │
//!  Submitted ──Expired──► Expired                 (terminal)
//! ```
//!
//! # Fill precedence
//!
//! A fill that logically occurred before a cancel acknowledgement at the
//! venue (by sequence number) may arrive after the cancel ack. Cancellation
//! never discards economic fact, so `Fill` is accepted in `Cancelled`: a
//! completing fill ends the order `Filled`; otherwise the order stays
//! `Cancelled` with the higher filled quantity (cancelled-after-partial).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

/// All states an order can occupy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created locally; no submission attempt has started.
    New,
    /// A submission attempt (possibly a retry) is in flight.
    Submitting,
    /// Acknowledged by the venue; no fills yet.
    Submitted,
    /// One or more fills received; not yet complete.
    PartiallyFilled,
    /// Fully filled. **Terminal.**
    Filled,
    /// Cancel acknowledged by the venue. **Terminal** (but see fill
    /// precedence in the module docs).
    Cancelled,
    /// Venue refused the submission. **Terminal.**
    Rejected,
    /// Expired at the venue without filling. **Terminal.**
    Expired,
    /// Submission could not be completed (retries exhausted or credentials
    /// invalid). **Terminal**; re-initiation requires a new client order id.
    Failed,
}

impl OrderStatus {
    /// `true` if no further transitions are possible (fill precedence aside).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired | Self::Failed
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Submitting => "SUBMITTING",
            Self::Submitted => "SUBMITTED",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// OrderEvent
// ---------------------------------------------------------------------------

/// Events that drive order state transitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderEvent {
    /// A submission attempt started.
    SubmitStarted,
    /// The venue acknowledged the submission.
    SubmitAcked,
    /// The venue refused the submission.
    SubmitRejected,
    /// Submission gave up (retries exhausted / unauthenticated).
    SubmitFailed,
    /// A fill was applied. `completes` is true when the order's filled
    /// quantity now equals its requested quantity.
    Fill { completes: bool },
    /// The venue acknowledged a cancel (or reported the order cancelled).
    CancelAcked,
    /// The venue reported the order expired.
    Expired,
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// Returned when an event cannot legally be applied in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: OrderStatus,
    pub event: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal order transition: {} + {}", self.from, self.event)
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

/// Compute the state following `event`, or fail for an illegal transition.
///
/// Pure and total over the legal event set; duplicate no-op events (a second
/// `CancelAcked` on a cancelled order, a late fill echo on a filled order)
/// return the current state unchanged rather than erroring.
pub fn transition(current: OrderStatus, event: &OrderEvent) -> Result<OrderStatus, TransitionError> {
    use OrderEvent::*;
    use OrderStatus::*;

    let next = match (current, event) {
        (New, SubmitStarted) => Submitting,
        // Re-entering Submitting on a retry attempt is a no-op.
        (Submitting, SubmitStarted) => Submitting,

        (Submitting, SubmitAcked) => Submitted,
        (Submitting, SubmitRejected) => Rejected,
        (Submitting, SubmitFailed) => Failed,

        // Fills from any acknowledged live state.
        (Submitted | PartiallyFilled, Fill { completes }) => {
            if *completes {
                Filled
            } else {
                PartiallyFilled
            }
        }

        // Fill precedence: a fill sequenced before the cancel ack is still
        // applied after Cancelled. Completion wins; otherwise the order
        // remains cancelled-after-partial.
        (Cancelled, Fill { completes }) => if *completes { Filled } else { Cancelled },

        // Late duplicate fill echo on a completed order: no-op.
        (Filled, Fill { .. }) => Filled,

        (Submitted | PartiallyFilled, CancelAcked) => Cancelled,
        (Cancelled, CancelAcked) => Cancelled,

        (Submitted, OrderEvent::Expired) => OrderStatus::Expired,

        (state, ev) => {
            return Err(TransitionError {
                from: state,
                event: format!("{ev:?}"),
            });
        }
    };

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderEvent::*;
    use OrderStatus::*;

    #[test]
    fn happy_path_to_filled() {
        let mut s = New;
        for (ev, expect) in [
            (SubmitStarted, Submitting),
            (SubmitAcked, Submitted),
            (Fill { completes: false }, PartiallyFilled),
            (Fill { completes: false }, PartiallyFilled),
            (Fill { completes: true }, Filled),
        ] {
            s = transition(s, &ev).unwrap();
            assert_eq!(s, expect);
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn submission_failures_are_terminal() {
        assert_eq!(transition(Submitting, &SubmitRejected).unwrap(), Rejected);
        assert_eq!(transition(Submitting, &SubmitFailed).unwrap(), Failed);
        assert!(transition(Rejected, &SubmitAcked).is_err());
        assert!(transition(Failed, &SubmitStarted).is_err());
    }

    #[test]
    fn cancel_from_live_states() {
        assert_eq!(transition(Submitted, &CancelAcked).unwrap(), Cancelled);
        assert_eq!(transition(PartiallyFilled, &CancelAcked).unwrap(), Cancelled);
    }

    #[test]
    fn duplicate_cancel_ack_is_noop() {
        assert_eq!(transition(Cancelled, &CancelAcked).unwrap(), Cancelled);
    }

    #[test]
    fn fill_precedence_after_cancel() {
        // Non-completing fill: stays cancelled-after-partial.
        assert_eq!(
            transition(Cancelled, &Fill { completes: false }).unwrap(),
            Cancelled
        );
        // Completing fill wins over the cancel.
        assert_eq!(
            transition(Cancelled, &Fill { completes: true }).unwrap(),
            Filled
        );
    }

    #[test]
    fn expiry_only_from_submitted() {
        assert_eq!(transition(Submitted, &OrderEvent::Expired).unwrap(), OrderStatus::Expired);
        assert!(transition(PartiallyFilled, &OrderEvent::Expired).is_err());
    }

    #[test]
    fn no_event_escapes_filled() {
        assert!(transition(Filled, &CancelAcked).is_err());
        assert!(transition(Filled, &SubmitAcked).is_err());
        // late fill echo tolerated, state unchanged
        assert_eq!(transition(Filled, &Fill { completes: true }).unwrap(), Filled);
    }

    #[test]
    fn retry_reenters_submitting() {
        let s = transition(New, &SubmitStarted).unwrap();
        assert_eq!(transition(s, &SubmitStarted).unwrap(), Submitting);
    }

    #[test]
    fn fills_require_acknowledged_order() {
        assert!(transition(New, &Fill { completes: false }).is_err());
        assert!(transition(Submitting, &Fill { completes: false }).is_err());
    }
}
