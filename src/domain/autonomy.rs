//! Autonomy levels and the action permission matrix

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Runtime autonomy level, ordered from least to most permissive
///
/// Only an operator command may change the runtime level. The executor,
/// the trust tracker, and the LLM never mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    Observe,
    Cautious,
    Moderate,
    Full,
}

impl AutonomyLevel {
    /// All levels in ascending order
    pub const ALL: [AutonomyLevel; 4] = [
        AutonomyLevel::Observe,
        AutonomyLevel::Cautious,
        AutonomyLevel::Moderate,
        AutonomyLevel::Full,
    ];

    /// The next level up, if any
    pub fn next(self) -> Option<AutonomyLevel> {
        match self {
            AutonomyLevel::Observe => Some(AutonomyLevel::Cautious),
            AutonomyLevel::Cautious => Some(AutonomyLevel::Moderate),
            AutonomyLevel::Moderate => Some(AutonomyLevel::Full),
            AutonomyLevel::Full => None,
        }
    }

    /// Whether this level permits executing the given action
    ///
    /// `skip` is always permitted (it is a no-op). In `observe` nothing
    /// executes; recommendations are surfaced as informational only.
    pub fn permits(self, action: Action) -> bool {
        match (self, action) {
            (_, Action::Skip) => true,
            (AutonomyLevel::Observe, _) => false,
            (AutonomyLevel::Cautious, Action::Start | Action::Notify) => true,
            (AutonomyLevel::Cautious, _) => false,
            (AutonomyLevel::Moderate | AutonomyLevel::Full, _) => true,
        }
    }
}

impl fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AutonomyLevel::Observe => "observe",
            AutonomyLevel::Cautious => "cautious",
            AutonomyLevel::Moderate => "moderate",
            AutonomyLevel::Full => "full",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AutonomyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "observe" => Ok(AutonomyLevel::Observe),
            "cautious" => Ok(AutonomyLevel::Cautious),
            "moderate" => Ok(AutonomyLevel::Moderate),
            "full" => Ok(AutonomyLevel::Full),
            other => Err(format!("unknown autonomy level: {}", other)),
        }
    }
}

/// Action the LLM may recommend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Restart,
    Notify,
    Skip,
}

impl Action {
    /// Parse from the LLM's string form; anything outside the allowlist is rejected
    pub fn parse(s: &str) -> Option<Action> {
        match s.trim().to_lowercase().as_str() {
            "start" => Some(Action::Start),
            "stop" => Some(Action::Stop),
            "restart" => Some(Action::Restart),
            "notify" => Some(Action::Notify),
            "skip" => Some(Action::Skip),
            _ => None,
        }
    }

    /// Whether this action has a side effect on sessions
    pub fn is_session_action(self) -> bool {
        matches!(self, Action::Start | Action::Stop | Action::Restart)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Notify => "notify",
            Action::Skip => "skip",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(AutonomyLevel::Observe < AutonomyLevel::Cautious);
        assert!(AutonomyLevel::Cautious < AutonomyLevel::Moderate);
        assert!(AutonomyLevel::Moderate < AutonomyLevel::Full);
    }

    #[test]
    fn test_matrix_observe_blocks_everything_but_skip() {
        let level = AutonomyLevel::Observe;
        assert!(!level.permits(Action::Start));
        assert!(!level.permits(Action::Stop));
        assert!(!level.permits(Action::Restart));
        assert!(!level.permits(Action::Notify));
        assert!(level.permits(Action::Skip));
    }

    #[test]
    fn test_matrix_cautious_allows_start_blocks_stop() {
        let level = AutonomyLevel::Cautious;
        assert!(level.permits(Action::Start));
        assert!(level.permits(Action::Notify));
        assert!(level.permits(Action::Skip));
        assert!(!level.permits(Action::Stop));
        assert!(!level.permits(Action::Restart));
    }

    #[test]
    fn test_matrix_moderate_and_full_allow_all() {
        for level in [AutonomyLevel::Moderate, AutonomyLevel::Full] {
            for action in [Action::Start, Action::Stop, Action::Restart, Action::Notify, Action::Skip] {
                assert!(level.permits(action), "{} should permit {}", level, action);
            }
        }
    }

    #[test]
    fn test_action_allowlist() {
        assert_eq!(Action::parse("start"), Some(Action::Start));
        assert_eq!(Action::parse(" RESTART "), Some(Action::Restart));
        assert_eq!(Action::parse("deploy"), None);
        assert_eq!(Action::parse(""), None);
    }

    #[test]
    fn test_level_round_trips_through_str() {
        for level in AutonomyLevel::ALL {
            assert_eq!(level.to_string().parse::<AutonomyLevel>().unwrap(), level);
        }
    }

    #[test]
    fn test_next_level() {
        assert_eq!(AutonomyLevel::Cautious.next(), Some(AutonomyLevel::Moderate));
        assert_eq!(AutonomyLevel::Full.next(), None);
    }
}
