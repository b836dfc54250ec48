//! Phase tracking for an environment.
//!
//! Phases only move forward, one step at a time. `Failed` can be entered from
//! any non-terminal phase; `Stopped` only from `ServicesReady`, via teardown.

use std::fmt;

use thiserror::Error;

/// Where an environment is in its bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Nothing provisioned yet.
    Unstarted,
    /// Network exists.
    NetworkReady,
    /// Broker is accepting connections.
    BrokerReady,
    /// Database is up and every logical database is bootstrapped.
    DatabaseReady,
    /// Every service passed its readiness wait.
    ServicesReady,
    /// Explicit teardown released everything.
    Stopped,
    /// A provisioning step failed; partial resources were disposed.
    Failed,
}

impl Phase {
    const fn successor(self) -> Option<Self> {
        match self {
            Self::Unstarted => Some(Self::NetworkReady),
            Self::NetworkReady => Some(Self::BrokerReady),
            Self::BrokerReady => Some(Self::DatabaseReady),
            Self::DatabaseReady => Some(Self::ServicesReady),
            Self::ServicesReady => Some(Self::Stopped),
            Self::Stopped | Self::Failed => None,
        }
    }

    /// `Stopped` and `Failed` admit no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::NetworkReady => "network_ready",
            Self::BrokerReady => "broker_ready",
            Self::DatabaseReady => "database_ready",
            Self::ServicesReady => "services_ready",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Returned when a transition would skip or reverse a phase.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid lifecycle transition from {from} to {to}")]
pub struct LifecycleError {
    /// Current phase.
    pub from: Phase,
    /// Requested phase.
    pub to: Phase,
}

/// Current phase plus every phase passed through.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    phase: Phase,
    history: Vec<Phase>,
}

impl Lifecycle {
    /// A lifecycle in `Unstarted`.
    pub fn new() -> Self {
        Self {
            phase: Phase::Unstarted,
            history: vec![Phase::Unstarted],
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase entered so far, oldest first.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    /// Move to `next` if it is the immediate successor, or `Failed` from a
    /// non-terminal phase.
    pub fn advance(&mut self, next: Phase) -> Result<(), LifecycleError> {
        let allowed = if next == Phase::Failed {
            !self.phase.is_terminal()
        } else {
            self.phase.successor() == Some(next)
        };

        if !allowed {
            return Err(LifecycleError {
                from: self.phase,
                to: next,
            });
        }

        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_walks_every_phase_in_order() {
        let mut lifecycle = Lifecycle::new();

        for phase in [
            Phase::NetworkReady,
            Phase::BrokerReady,
            Phase::DatabaseReady,
            Phase::ServicesReady,
            Phase::Stopped,
        ] {
            lifecycle.advance(phase).expect("forward transition");
        }

        assert_eq!(lifecycle.phase(), Phase::Stopped);
        assert_eq!(lifecycle.history().len(), 6);
    }

    #[test]
    fn lifecycle_rejects_skipping_the_database() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Phase::NetworkReady).expect("network");
        lifecycle.advance(Phase::BrokerReady).expect("broker");

        let error = lifecycle
            .advance(Phase::ServicesReady)
            .expect_err("services before database must be rejected");

        assert_eq!(
            error,
            LifecycleError {
                from: Phase::BrokerReady,
                to: Phase::ServicesReady
            }
        );
        assert_eq!(lifecycle.phase(), Phase::BrokerReady);
    }

    #[test]
    fn lifecycle_rejects_going_backwards() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Phase::NetworkReady).expect("network");

        assert!(lifecycle.advance(Phase::Unstarted).is_err());
        assert!(lifecycle.advance(Phase::NetworkReady).is_err());
    }

    #[test]
    fn stopped_is_only_reachable_from_services_ready() {
        let mut lifecycle = Lifecycle::new();

        assert!(lifecycle.advance(Phase::Stopped).is_err());
    }

    #[test]
    fn failed_is_terminal() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Phase::NetworkReady).expect("network");
        lifecycle.advance(Phase::Failed).expect("failure from any live phase");

        assert!(lifecycle.advance(Phase::Failed).is_err());
        assert!(lifecycle.advance(Phase::BrokerReady).is_err());
        assert_eq!(
            lifecycle.history(),
            &[Phase::Unstarted, Phase::NetworkReady, Phase::Failed]
        );
    }
}
