//! Ranked participant sets.

use crate::Error;
use commonware_cryptography::PublicKey;
use std::collections::BTreeSet;

/// Participants of one attempt, ranked `1..=N` by the canonical order of their keys.
///
/// Every honest participant derives the same ranks from the same key set, so ranks never need
/// to be negotiated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Players<P: PublicKey> {
    keys: Vec<P>,
    me: P,
}

impl<P: PublicKey> Players<P> {
    /// Rank `participants` (which must include `me`). Duplicate keys are collapsed.
    pub fn new(participants: impl IntoIterator<Item = P>, me: P) -> Result<Self, Error<P>> {
        let keys: Vec<P> = participants
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if keys.binary_search(&me).is_err() {
            return Err(Error::NotParticipating);
        }
        Ok(Self { keys, me })
    }

    /// Number of participants (including self).
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns whether there are no participants.
    ///
    /// Always `false`: a set always contains the local participant.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The local participant.
    pub fn me(&self) -> &P {
        &self.me
    }

    /// Rank (1-based) of the local participant.
    pub fn my_rank(&self) -> usize {
        // `new` guarantees membership
        self.rank(&self.me).unwrap_or_default()
    }

    /// Rank (1-based) of `key`, if it participates.
    pub fn rank(&self, key: &P) -> Option<usize> {
        self.keys.binary_search(key).ok().map(|index| index + 1)
    }

    /// Key of the participant at `rank` (1-based).
    pub fn key(&self, rank: usize) -> Option<&P> {
        rank.checked_sub(1).and_then(|index| self.keys.get(index))
    }

    /// Returns whether `key` participates.
    pub fn contains(&self, key: &P) -> bool {
        self.keys.binary_search(key).is_ok()
    }

    /// All participants in rank order (including self).
    pub fn all(&self) -> &[P] {
        &self.keys
    }

    /// All participants in rank order, excluding self.
    pub fn others(&self) -> Vec<P> {
        self.player_set(1, self.len())
    }

    /// Participants (excluding self) whose rank lies in `[max(from, 1), min(to, N)]`.
    ///
    /// Out-of-range bounds are clipped rather than rejected, so an empty range simply yields an
    /// empty set.
    pub fn player_set(&self, from: usize, to: usize) -> Vec<P> {
        let from = from.max(1);
        let to = to.min(self.len());
        if from > to {
            return Vec::new();
        }
        self.keys[from - 1..to]
            .iter()
            .filter(|key| **key != self.me)
            .cloned()
            .collect()
    }

    /// The participant ranked directly before self, if any.
    pub fn predecessor(&self) -> Option<&P> {
        self.key(self.my_rank() - 1)
    }

    /// The participant ranked directly after self, if any.
    pub fn successor(&self) -> Option<&P> {
        self.key(self.my_rank() + 1)
    }

    /// The last-ranked participant.
    pub fn last(&self) -> &P {
        // Never empty: `me` is always present
        &self.keys[self.keys.len() - 1]
    }

    /// Returns a new set without `excluded`.
    pub fn exclude<'a>(&self, excluded: impl IntoIterator<Item = &'a P>) -> Result<Self, Error<P>> {
        let excluded: BTreeSet<&P> = excluded.into_iter().collect();
        Self::new(
            self.keys
                .iter()
                .filter(|key| !excluded.contains(key))
                .cloned(),
            self.me.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey as Identity},
        PrivateKeyExt, Signer,
    };

    /// Keys sorted by rank.
    fn ranked(n: u64) -> Vec<Identity> {
        let mut keys: Vec<_> = (0..n).map(|i| PrivateKey::from_seed(i).public_key()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_single_player() {
        let keys = ranked(1);
        let players = Players::new(keys.clone(), keys[0].clone()).unwrap();
        for (i, n) in [(0, 0), (1, 1), (0, 5), (2, 3), (1, 100)] {
            assert!(players.player_set(i, n).is_empty());
        }
        assert_eq!(players.predecessor(), None);
        assert_eq!(players.successor(), None);
    }

    #[test]
    fn test_window_excludes_self() {
        let keys = ranked(5);
        let players = Players::new(keys.clone(), keys[0].clone()).unwrap();
        assert_eq!(players.my_rank(), 1);
        assert_eq!(players.player_set(1, 3), keys[1..3].to_vec());
    }

    #[test]
    fn test_window_clips() {
        let keys = ranked(5);
        let players = Players::new(keys.clone(), keys[2].clone()).unwrap();
        assert_eq!(players.my_rank(), 3);
        assert_eq!(
            players.player_set(0, 100),
            vec![
                keys[0].clone(),
                keys[1].clone(),
                keys[3].clone(),
                keys[4].clone()
            ]
        );
        assert_eq!(players.player_set(4, 9), keys[3..5].to_vec());
        assert!(players.player_set(4, 2).is_empty());
        assert!(players.player_set(6, 9).is_empty());
        assert!(players.player_set(3, 3).is_empty());
    }

    #[test]
    fn test_window_matches_rank_range() {
        let keys = ranked(6);
        for me in 0..6 {
            let players = Players::new(keys.clone(), keys[me].clone()).unwrap();
            let r = me + 1;
            for i in 0..=7 {
                for n in i..=7 {
                    let expected: Vec<_> = (i.max(1)..=n.min(6))
                        .filter(|rank| *rank != r)
                        .map(|rank| keys[rank - 1].clone())
                        .collect();
                    assert_eq!(players.player_set(i, n), expected);
                }
            }
        }
    }

    #[test]
    fn test_ranks_independent_of_input_order() {
        let keys = ranked(4);
        let mut reversed = keys.clone();
        reversed.reverse();
        let a = Players::new(keys.clone(), keys[1].clone()).unwrap();
        let b = Players::new(reversed, keys[1].clone()).unwrap();
        assert_eq!(a, b);
        for (index, key) in keys.iter().enumerate() {
            assert_eq!(a.rank(key), Some(index + 1));
            assert_eq!(a.key(index + 1), Some(key));
        }
        assert_eq!(a.key(0), None);
        assert_eq!(a.key(5), None);
        assert_eq!(a.predecessor(), Some(&keys[0]));
        assert_eq!(a.successor(), Some(&keys[2]));
        assert_eq!(a.last(), &keys[3]);
    }

    #[test]
    fn test_duplicates_collapse() {
        let keys = ranked(3);
        let participants = [
            keys[0].clone(),
            keys[1].clone(),
            keys[1].clone(),
            keys[2].clone(),
        ];
        let players = Players::new(participants, keys[0].clone()).unwrap();
        assert_eq!(players.len(), 3);
    }

    #[test]
    fn test_not_participating() {
        let keys = ranked(3);
        let outsider = PrivateKey::from_seed(99).public_key();
        assert!(matches!(
            Players::new(keys, outsider),
            Err(Error::NotParticipating)
        ));
    }

    #[test]
    fn test_exclude() {
        let keys = ranked(4);
        let players = Players::new(keys.clone(), keys[2].clone()).unwrap();
        let remaining = players.exclude([&keys[0]]).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining.my_rank(), 2);
        assert!(!remaining.contains(&keys[0]));
        assert!(matches!(
            players.exclude([&keys[2]]),
            Err(Error::NotParticipating)
        ));
    }
}
