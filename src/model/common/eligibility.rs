use std::fmt::{Display, Formatter};

use mongodb::bson::{doc, Document};

use crate::model::common::identity::IdentityHash;

/// Where a participant stands on the way to casting their vote.
///
/// Transitions only move forward: `Unregistered -> Registered -> Paid -> Voted`.
/// `Voted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParticipantState {
    Unregistered,
    Registered,
    Paid,
    Voted,
}

impl ParticipantState {
    /// Derive the state from the stored flags, if a participant exists.
    pub fn from_flags(flags: Option<(bool, bool)>) -> Self {
        match flags {
            None => Self::Unregistered,
            Some((_, true)) => Self::Voted,
            Some((true, false)) => Self::Paid,
            Some((false, false)) => Self::Registered,
        }
    }

    /// Only a paid participant who has not yet voted may vote.
    pub fn may_vote(self) -> bool {
        self == Self::Paid
    }

    /// Filter matching a participant with this identity only while they may vote.
    /// Claiming a vote is an update through this filter, so the check and the
    /// transition to `Voted` happen in a single atomic write.
    pub fn may_vote_filter(identity_hash: &IdentityHash) -> Document {
        doc! {
            "identity_hash": identity_hash,
            "paid": true,
            "voted": false,
        }
    }
}

impl Display for ParticipantState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "unpaid",
            Self::Paid => "paid",
            Self::Voted => "already voted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::common::identity::Identity;

    #[test]
    fn states_from_flags() {
        assert_eq!(
            ParticipantState::from_flags(None),
            ParticipantState::Unregistered
        );
        assert_eq!(
            ParticipantState::from_flags(Some((false, false))),
            ParticipantState::Registered
        );
        assert_eq!(
            ParticipantState::from_flags(Some((true, false))),
            ParticipantState::Paid
        );
        assert_eq!(
            ParticipantState::from_flags(Some((true, true))),
            ParticipantState::Voted
        );
        // Never produced by the store, but voted always wins.
        assert_eq!(
            ParticipantState::from_flags(Some((false, true))),
            ParticipantState::Voted
        );
    }

    #[test]
    fn only_paid_may_vote() {
        assert!(!ParticipantState::Unregistered.may_vote());
        assert!(!ParticipantState::Registered.may_vote());
        assert!(ParticipantState::Paid.may_vote());
        assert!(!ParticipantState::Voted.may_vote());
    }

    #[test]
    fn states_are_ordered() {
        assert!(ParticipantState::Unregistered < ParticipantState::Registered);
        assert!(ParticipantState::Registered < ParticipantState::Paid);
        assert!(ParticipantState::Paid < ParticipantState::Voted);
    }

    #[test]
    fn filter_requires_paid_and_not_voted() {
        let hash = Identity::example().hash();
        let filter = ParticipantState::may_vote_filter(&hash);
        assert_eq!(filter.get_str("identity_hash").unwrap(), hash.as_str());
        assert!(filter.get_bool("paid").unwrap());
        assert!(!filter.get_bool("voted").unwrap());
    }
}
