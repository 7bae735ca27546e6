use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The discrete verdict attached to a scan.
///
/// Variants are declared least-severe first; `Action::severity` returns a
/// smaller number for more severe actions so that "lower = more severe"
/// (as used by `pre_result` clamping, spec §4.2) falls out of `Ord`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    NoAction,
    Greylist,
    AddHeader,
    RewriteSubject,
    SoftReject,
    Reject,
}

impl Action {
    /// All actions ordered from least to most severe.
    pub const ALL: [Action; 6] = [
        Action::NoAction,
        Action::Greylist,
        Action::AddHeader,
        Action::RewriteSubject,
        Action::SoftReject,
        Action::Reject,
    ];

    /// Lower value means more severe. `Reject` is 0, `NoAction` is 5.
    pub fn severity(self) -> u8 {
        match self {
            Action::Reject => 0,
            Action::SoftReject => 1,
            Action::RewriteSubject => 2,
            Action::AddHeader => 3,
            Action::Greylist => 4,
            Action::NoAction => 5,
        }
    }

    pub fn from_severity(severity: u8) -> Option<Action> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.severity() == severity)
    }

    /// Actions ordered most-severe-first, the order `check_action` walks.
    pub fn most_severe_first() -> impl Iterator<Item = Action> {
        let mut all = Action::ALL;
        all.sort_by_key(|a| a.severity());
        all.into_iter()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::NoAction => "no action",
            Action::Greylist => "greylist",
            Action::AddHeader => "add header",
            Action::RewriteSubject => "rewrite subject",
            Action::SoftReject => "soft reject",
            Action::Reject => "reject",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialOrd for Action {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Action {
    /// Ordering follows severity: `Reject < SoftReject < ... < NoAction`.
    fn cmp(&self, other: &Self) -> Ordering {
        self.severity().cmp(&other.severity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_severe_actions_compare_less() {
        assert!(Action::Reject < Action::SoftReject);
        assert!(Action::SoftReject < Action::NoAction);
    }

    #[test]
    fn severity_round_trips() {
        for action in Action::ALL {
            assert_eq!(Action::from_severity(action.severity()), Some(action));
        }
    }

    #[test]
    fn most_severe_first_starts_at_reject() {
        let first = Action::most_severe_first().next().unwrap();
        assert_eq!(first, Action::Reject);
    }
}
