use crate::error::{MixerError, Result};
use crate::model::{EntryStatus, MixStatus, OperationStatus};
use std::fmt::Display;

/// Transition rules shared by every tracked entity.
///
/// Moving to the current state is a no-op. Terminal states never move again.
pub trait Lifecycle: Copy + Eq + Display + 'static {
    const TRANSITIONS: &'static [(Self, Self)];

    fn is_terminal(&self) -> bool;

    fn can_transition_to(&self, to: Self) -> bool {
        *self == to || Self::TRANSITIONS.contains(&(*self, to))
    }

    fn validate_transition(&self, to: Self) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(MixerError::invalid_state(self, to))
        }
    }
}

impl Lifecycle for MixStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (MixStatus::PendingDeposit, MixStatus::DepositReceived),
        (MixStatus::PendingDeposit, MixStatus::Cancelled),
        (MixStatus::PendingDeposit, MixStatus::Expired),
        (MixStatus::PendingDeposit, MixStatus::Failed),
        (MixStatus::DepositReceived, MixStatus::Mixing),
        (MixStatus::DepositReceived, MixStatus::Cancelled),
        (MixStatus::DepositReceived, MixStatus::Failed),
        (MixStatus::Mixing, MixStatus::Distributing),
        (MixStatus::Mixing, MixStatus::Failed),
        (MixStatus::Distributing, MixStatus::Completed),
        (MixStatus::Distributing, MixStatus::Failed),
    ];

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            MixStatus::Completed | MixStatus::Failed | MixStatus::Cancelled | MixStatus::Expired
        )
    }
}

impl Lifecycle for EntryStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (EntryStatus::Active, EntryStatus::Mixing),
        (EntryStatus::Active, EntryStatus::Withdrawn),
        (EntryStatus::Mixing, EntryStatus::Active),
        (EntryStatus::Mixing, EntryStatus::Distributed),
    ];

    fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Distributed | EntryStatus::Withdrawn)
    }
}

impl Lifecycle for OperationStatus {
    const TRANSITIONS: &'static [(Self, Self)] = &[
        (OperationStatus::Scheduled, OperationStatus::Executing),
        (OperationStatus::Scheduled, OperationStatus::Cancelled),
        (OperationStatus::Executing, OperationStatus::Completed),
        (OperationStatus::Executing, OperationStatus::Failed),
    ];

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}
