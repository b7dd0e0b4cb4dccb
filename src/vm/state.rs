//! VM lifecycle state types.

use serde::{Deserialize, Serialize};

/// VM lifecycle states.
///
/// `Off` and `Stopped` are both "not running"; backends that distinguish a
/// confirmed power-off (LXD `102`, VirtualBox `poweroff`) report `Stopped`.
/// `DelayedShutdown` is never reported by a backend: it is an overlay the
/// orchestrator keeps while a delayed shutdown timer is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    /// Powered off.
    #[default]
    Off,

    /// Powered off, exit confirmed by the backend.
    Stopped,

    /// Boot (or resume) requested, not yet confirmed.
    Starting,

    /// Guest-initiated reboot in progress.
    Restarting,

    /// Running.
    Running,

    /// Running with a shutdown timer armed.
    DelayedShutdown,

    /// Suspend in progress.
    Suspending,

    /// Suspended to disk.
    Suspended,

    /// Backend could not be queried; re-probe.
    Unknown,
}

impl VmState {
    /// Check if the VM is powered off.
    pub fn is_stopped(&self) -> bool {
        matches!(self, VmState::Off | VmState::Stopped)
    }

    /// Check if the guest is executing (running, rebooting or counting down).
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::DelayedShutdown | VmState::Restarting
        )
    }

    /// Check if the VM can be started.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            VmState::Off | VmState::Stopped | VmState::Suspended | VmState::Unknown
        )
    }

    /// Check if a suspend request would do any work.
    pub fn can_suspend(&self) -> bool {
        matches!(self, VmState::Running | VmState::DelayedShutdown)
    }

    /// Check whether `self -> next` is a transition the lifecycle allows.
    ///
    /// Backend-reported truth may move the cache anywhere after `Unknown`;
    /// this table describes what the orchestrator itself requests or accepts
    /// from asynchronous events.
    pub fn can_transition_to(&self, next: VmState) -> bool {
        use VmState::*;

        if *self == next {
            return true;
        }

        match (*self, next) {
            // Probe failure is always possible.
            (_, Unknown) => true,
            // Asynchronous reset/reboot.
            (_, Restarting) => true,
            (Restarting, Running) => true,
            // Backend truth wins over an unknown cache.
            (Unknown, Off | Stopped | Running | Suspended | Starting | Suspending) => true,
            (Off | Stopped, Starting) => true,
            (Off, Stopped) | (Stopped, Off) => true,
            (Starting, Running) => true,
            (Starting, Off | Stopped) => true,
            (Running, DelayedShutdown) => true,
            (DelayedShutdown, Running) => true,
            (Running | DelayedShutdown, Suspending | Suspended) => true,
            (Suspending, Suspended) => true,
            (Running | DelayedShutdown, Off | Stopped) => true,
            (Suspended, Starting) => true,
            (Suspended, Off | Stopped) => true,
            _ => false,
        }
    }

    /// Merge a live probe result into the cached state.
    ///
    /// A cached `Starting` hides a `Running` probe until the start sequence
    /// settles, and an armed delayed shutdown keeps reporting
    /// `DelayedShutdown` while the backend is still running. Otherwise the
    /// backend wins.
    pub fn reconcile(cached: VmState, probed: VmState) -> VmState {
        match (cached, probed) {
            (VmState::Starting, VmState::Running) => VmState::Starting,
            (VmState::DelayedShutdown, VmState::Running) => VmState::DelayedShutdown,
            (_, probed) => probed,
        }
    }

    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            VmState::Off => "off",
            VmState::Stopped => "stopped",
            VmState::Starting => "starting",
            VmState::Restarting => "restarting",
            VmState::Running => "running",
            VmState::DelayedShutdown => "delayed_shutdown",
            VmState::Suspending => "suspending",
            VmState::Suspended => "suspended",
            VmState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How hard to stop an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Ask the guest to power down (ACPI, guest agent).
    #[default]
    Graceful,

    /// Terminate immediately.
    Forced,
}

impl std::fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPolicy::Graceful => write!(f, "graceful"),
            ShutdownPolicy::Forced => write!(f, "forced"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_state_predicates() {
        // (state, is_stopped, can_start, can_suspend)
        let cases = [
            (VmState::Off, true, true, false),
            (VmState::Stopped, true, true, false),
            (VmState::Starting, false, false, false),
            (VmState::Running, false, false, true),
            (VmState::DelayedShutdown, false, false, true),
            (VmState::Suspended, false, true, false),
            (VmState::Unknown, false, true, false),
        ];

        for (state, stopped, start, suspend) in cases {
            assert_eq!(state.is_stopped(), stopped, "{:?}.is_stopped()", state);
            assert_eq!(state.can_start(), start, "{:?}.can_start()", state);
            assert_eq!(state.can_suspend(), suspend, "{:?}.can_suspend()", state);
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        use VmState::*;

        let legal = [
            (Off, Starting),
            (Stopped, Starting),
            (Starting, Running),
            (Starting, Off),
            (Running, DelayedShutdown),
            (Running, Suspending),
            (Suspending, Suspended),
            (DelayedShutdown, Suspended),
            (Running, Off),
            (DelayedShutdown, Off),
            (Suspended, Starting),
            (Restarting, Running),
            (Unknown, Running),
            (Unknown, Suspended),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{} -> {} should be legal", from, to);
        }

        let illegal = [
            (Off, Running),
            (Off, Suspended),
            (Suspended, Running),
            (Starting, Suspended),
            (Off, DelayedShutdown),
            (Suspending, Running),
        ];
        for (from, to) in illegal {
            assert!(!from.can_transition_to(to), "{} -> {} should be illegal", from, to);
        }
    }

    #[test]
    fn test_any_state_can_become_unknown_or_restarting() {
        use VmState::*;
        for state in [Off, Stopped, Starting, Running, DelayedShutdown, Suspending, Suspended] {
            assert!(state.can_transition_to(Unknown));
            assert!(state.can_transition_to(Restarting));
        }
    }

    #[test]
    fn test_reconcile_precedence() {
        use VmState::*;
        assert_eq!(VmState::reconcile(Starting, Running), Starting);
        assert_eq!(VmState::reconcile(DelayedShutdown, Running), DelayedShutdown);
        assert_eq!(VmState::reconcile(DelayedShutdown, Off), Off);
        assert_eq!(VmState::reconcile(Starting, Off), Off);
        assert_eq!(VmState::reconcile(Running, Suspended), Suspended);
        assert_eq!(VmState::reconcile(Unknown, Running), Running);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&VmState::DelayedShutdown).unwrap();
        assert_eq!(json, "\"delayed_shutdown\"");
        let state: VmState = serde_json::from_str("\"suspended\"").unwrap();
        assert_eq!(state, VmState::Suspended);
    }
}
