//! Fulfillment state machine
//!
//! # Design
//!
//! The internally-owned `operation_status` of a [`Posting`] is driven by two
//! input classes:
//!
//! 1. **Operator commands** ([`FulfillmentCommand`]) applied via
//!    [`apply_command`]. Illegal commands return [`CommandError`] and leave
//!    the posting untouched.
//! 2. **Remote observations** ([`RemoteStage`]) applied via
//!    [`observe_remote`]. These never fail: an observation that does not
//!    apply is a no-op.
//!
//! Both are idempotent. Re-applying an input that has already taken effect
//! returns a [`Transition`] with no state change and no effects, so a side
//! effect such as stock deduction is emitted at most once per posting
//! (guarded by `stock_deducted`).
//!
//! # State diagram
//!
//! ```text
//!  awaiting_stock ─► allocating ─► allocated ─► tracking_confirmed ─► printed ─► shipping ─► delivered
//!        │               │             │                │                │          │
//!        └───────────────┴─────────────┴────────────────┴────────────────┴──────────┴──► cancelled
//! ```
//!
//! Forward moves may skip states when driven remotely (in-transit jumps to
//! `shipping` once tracking is confirmed). Nothing moves backwards except the
//! explicit cancel.

use mps_schemas::{OperationStatus, Posting, RemoteStage};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Explicit operator commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FulfillmentCommand {
    /// Reserve and deduct stock (→ `allocated`).
    PrepareStock,
    /// Attach carrier tracking numbers (→ `tracking_confirmed`).
    SubmitTracking { numbers: Vec<String> },
    /// Shipping label printed (→ `printed`).
    MarkPrinted,
    /// Operator cancels the posting (→ `cancelled`).
    Discard,
}

impl FulfillmentCommand {
    pub fn name(&self) -> &'static str {
        match self {
            FulfillmentCommand::PrepareStock => "prepare_stock",
            FulfillmentCommand::SubmitTracking { .. } => "submit_tracking",
            FulfillmentCommand::MarkPrinted => "mark_printed",
            FulfillmentCommand::Discard => "discard",
        }
    }
}

/// Side effects a transition asks the caller to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    DeductStock,
    RestoreStock,
}

/// Result of applying one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: OperationStatus,
    pub to: OperationStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(at: OperationStatus) -> Self {
        Self {
            from: at,
            to: at,
            effects: Vec::new(),
        }
    }

    pub fn status_changed(&self) -> bool {
        self.from != self.to
    }

    pub fn is_noop(&self) -> bool {
        !self.status_changed() && self.effects.is_empty()
    }
}

/// Knobs for remote-driven transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Protect operator-finalized states from a remote cancellation.
    pub preserve_manual: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            preserve_manual: true,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandError
// ---------------------------------------------------------------------------

/// Returned when an operator command cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command is not legal from the current state.
    Illegal {
        from: OperationStatus,
        command: &'static str,
    },
    /// The command carried unusable input.
    Invalid(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Illegal { from, command } => {
                write!(f, "illegal fulfillment transition: {} + {}", from, command)
            }
            CommandError::Invalid(msg) => write!(f, "invalid fulfillment command: {msg}"),
        }
    }
}

impl std::error::Error for CommandError {}

// ---------------------------------------------------------------------------
// Operator commands
// ---------------------------------------------------------------------------

/// Apply an operator command to `posting`.
///
/// On error the posting is not modified.
pub fn apply_command(
    posting: &mut Posting,
    command: &FulfillmentCommand,
) -> Result<Transition, CommandError> {
    use OperationStatus::*;

    let from = posting.operation_status;
    let illegal = || CommandError::Illegal {
        from,
        command: command.name(),
    };

    match command {
        FulfillmentCommand::PrepareStock => match from {
            AwaitingStock | Allocating => {
                let mut t = move_to(posting, Allocated);
                deduct_once(posting, &mut t);
                Ok(t)
            }
            Allocated => Ok(Transition::unchanged(from)),
            _ => Err(illegal()),
        },

        FulfillmentCommand::SubmitTracking { numbers } => {
            let cleaned: Vec<&str> = numbers
                .iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .collect();
            if cleaned.is_empty() {
                return Err(CommandError::Invalid(
                    "submit_tracking requires at least one tracking number".to_string(),
                ));
            }
            match from {
                Allocated | TrackingConfirmed => {
                    for n in cleaned {
                        posting.add_tracking_number(n);
                    }
                    posting.has_tracking = true;
                    Ok(move_to(posting, TrackingConfirmed))
                }
                _ => Err(illegal()),
            }
        }

        FulfillmentCommand::MarkPrinted => match from {
            TrackingConfirmed => {
                posting.printed = true;
                Ok(move_to(posting, Printed))
            }
            Printed => Ok(Transition::unchanged(from)),
            _ => Err(illegal()),
        },

        FulfillmentCommand::Discard => match from {
            Cancelled => Ok(Transition::unchanged(from)),
            Delivered => Err(illegal()),
            _ => Ok(cancel(posting)),
        },
    }
}

// ---------------------------------------------------------------------------
// Remote observations
// ---------------------------------------------------------------------------

/// Apply a remote-observed lifecycle stage to `posting`.
pub fn observe_remote(posting: &mut Posting, stage: RemoteStage, policy: &Policy) -> Transition {
    use OperationStatus::*;

    let from = posting.operation_status;

    match stage {
        RemoteStage::Cancelled => {
            if from.is_terminal() {
                return Transition::unchanged(from);
            }
            if policy.preserve_manual && is_operator_finalized(from) {
                return Transition::unchanged(from);
            }
            cancel(posting)
        }

        RemoteStage::Delivered => {
            if from.is_terminal() {
                return Transition::unchanged(from);
            }
            let mut t = move_to(posting, Delivered);
            deduct_once(posting, &mut t);
            t
        }

        RemoteStage::InTransit => {
            if from.is_terminal() {
                return Transition::unchanged(from);
            }
            let target = if tracking_confirmed(posting) {
                Shipping
            } else {
                Allocating
            };
            if target.rank() <= from.rank() {
                return Transition::unchanged(from);
            }
            let mut t = move_to(posting, target);
            if target == Shipping {
                deduct_once(posting, &mut t);
            }
            t
        }

        RemoteStage::AwaitingPackaging | RemoteStage::AwaitingDeliver | RemoteStage::Unknown => {
            Transition::unchanged(from)
        }
    }
}

/// States an operator reached deliberately and a stale poll must not undo.
pub fn is_operator_finalized(status: OperationStatus) -> bool {
    matches!(
        status,
        OperationStatus::TrackingConfirmed | OperationStatus::Printed
    )
}

/// Tracking is confirmed once the operator submitted it or the platform
/// reported a tracking number.
pub fn tracking_confirmed(posting: &Posting) -> bool {
    posting.has_tracking
        || (posting.operation_status.rank() >= OperationStatus::TrackingConfirmed.rank()
            && posting.operation_status != OperationStatus::Cancelled)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn move_to(posting: &mut Posting, to: OperationStatus) -> Transition {
    let from = posting.operation_status;
    posting.operation_status = to;
    Transition {
        from,
        to,
        effects: Vec::new(),
    }
}

fn deduct_once(posting: &mut Posting, t: &mut Transition) {
    if !posting.stock_deducted {
        posting.stock_deducted = true;
        t.effects.push(Effect::DeductStock);
    }
}

fn cancel(posting: &mut Posting) -> Transition {
    let mut t = move_to(posting, OperationStatus::Cancelled);
    if posting.stock_deducted {
        posting.stock_deducted = false;
        t.effects.push(Effect::RestoreStock);
    }
    t
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
