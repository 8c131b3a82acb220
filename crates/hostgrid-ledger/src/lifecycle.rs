//! The resource status state machine.
//!
//! One machine shared by every kind. Transitions outside this table are
//! rejected by [`crate::Ledger::compare_and_swap`] regardless of what the
//! caller expected.

use std::fmt;

use crate::resource::ResourceStatus;

impl ResourceStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Writing the same status again is always allowed; it is how
    /// updates touch a row without moving it through the machine.
    pub fn can_transition_to(&self, next: ResourceStatus) -> bool {
        use ResourceStatus::*;
        if *self == next {
            return true;
        }
        match (self, next) {
            (Pending, Provisioning) => true,
            (Provisioning, Active) => true,
            // An accepted migration re-provisions a live resource on its target.
            (Active, Provisioning) => true,
            (Active, Suspended) | (Suspended, Active) => true,
            // Retry, including a retried de-provision or suspension.
            (Failed, Provisioning) | (Failed, Deleting) | (Failed, Suspended) => true,
            (Active, Deleting) => true,
            (Deleting, Deleted) => true,
            (Deleted, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

/// Caller-level operations with a status precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Update,
    Delete,
    Suspend,
    Unsuspend,
    Retry,
    Migrate,
}

impl Action {
    /// Statuses from which the action may start.
    pub fn allowed_from(&self) -> &'static [ResourceStatus] {
        use ResourceStatus::*;
        match self {
            Action::Update => &[Active, Suspended, Failed],
            Action::Delete => &[Active, Failed],
            Action::Suspend => &[Active],
            Action::Unsuspend => &[Suspended],
            Action::Retry => &[Failed],
            Action::Migrate => &[Active, Failed],
        }
    }

    pub fn permits(&self, status: ResourceStatus) -> bool {
        self.allowed_from().contains(&status)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Suspend => "suspend",
            Action::Unsuspend => "unsuspend",
            Action::Retry => "retry",
            Action::Migrate => "migrate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human-readable precondition failure for `action` on a resource in `status`.
pub fn precondition_message(action: Action, status: ResourceStatus) -> String {
    let allowed: Vec<&str> = action.allowed_from().iter().map(|s| s.as_str()).collect();
    format!(
        "cannot {action} a resource in status {status} (allowed: {})",
        allowed.join(", ")
    )
}

/// Trim a status message to what the ledger stores.
pub fn truncate_message(message: &str) -> String {
    const MAX: usize = 4000;
    if message.len() <= MAX {
        return message.to_string();
    }
    let mut end = MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
