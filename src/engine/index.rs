//! Derived priority indices over the state map.
//!
//! Two structures, both strictly derived from user states and updated on
//! every `set`: a per-opinion priority map of who-to-ask candidates, and a
//! map of scheduled wake-ups. Being derived means they can be rebuilt from
//! scratch at any time; tests rely on rebuild matching incremental
//! maintenance.

use std::collections::{BTreeSet, HashMap};

use crate::clock::Timestamp;
use crate::model::{Opinion, Uid, UserState};

/// Candidate priority: lexicographic `(class, tie_break)`, lower wins.
pub type Score = (u8, i64);

/// Priority of `state` as a candidate for a searcher who wants to talk to
/// holders of `opinion`. `None` means not eligible.
///
/// Classes: a `Waiting` searcher beats an unreserved `Asking` beats a
/// passive `Active`; within a class the most urgent deadline (or the most
/// recently active) wins.
pub fn search_score(state: &UserState, opinion: Opinion) -> Option<Score> {
    if state.profile().map(|p| p.opinion) != Some(opinion) {
        return None;
    }
    match *state {
        UserState::Waiting {
            searching_until, ..
        } => Some((1, searching_until.as_secs())),
        UserState::Asking {
            asking_until,
            waited_by: None,
            ..
        } => Some((2, asking_until.as_secs())),
        UserState::Active { since, .. } => Some((3, -since.as_secs())),
        _ => None,
    }
}

/// A keyed min-priority map: `upsert`/`remove` in O(log n), `top` in O(log n)
/// tree descent. Ties are broken by `Uid`, so ordering is deterministic.
#[derive(Debug, Clone)]
pub struct PriorityMap<K: Ord + Copy> {
    sorted: BTreeSet<(K, Uid)>,
    keys: HashMap<Uid, K>,
}

impl<K: Ord + Copy> Default for PriorityMap<K> {
    fn default() -> Self {
        PriorityMap::new()
    }
}

impl<K: Ord + Copy> PriorityMap<K> {
    pub fn new() -> Self {
        PriorityMap {
            sorted: BTreeSet::new(),
            keys: HashMap::new(),
        }
    }

    pub fn upsert(&mut self, uid: Uid, key: K) {
        if let Some(old) = self.keys.insert(uid, key) {
            self.sorted.remove(&(old, uid));
        }
        self.sorted.insert((key, uid));
    }

    pub fn remove(&mut self, uid: Uid) {
        if let Some(old) = self.keys.remove(&uid) {
            self.sorted.remove(&(old, uid));
        }
    }

    /// The uid with the minimum key, or `None` when empty.
    pub fn top(&self) -> Option<Uid> {
        self.sorted.first().map(|&(_, uid)| uid)
    }

    pub fn get(&self, uid: Uid) -> Option<K> {
        self.keys.get(&uid).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Both derived indices, bundled so the store updates them in one place.
#[derive(Debug, Default, Clone)]
pub struct Indices {
    by_score: [PriorityMap<Score>; 2],
    by_sched: PriorityMap<Timestamp>,
}

impl Indices {
    pub fn new() -> Self {
        Indices::default()
    }

    /// Re-derive both indices for `state`. Called on every `set`.
    pub fn update(&mut self, state: &UserState) {
        let uid = state.uid();
        match state.sched() {
            Some(at) => self.by_sched.upsert(uid, at),
            None => self.by_sched.remove(uid),
        }
        for opinion in Opinion::ALL {
            match search_score(state, opinion) {
                Some(score) => self.by_score[opinion.idx()].upsert(uid, score),
                None => self.by_score[opinion.idx()].remove(uid),
            }
        }
    }

    pub fn best_candidate(&self, opinion: Opinion) -> Option<Uid> {
        self.by_score[opinion.idx()].top()
    }

    pub fn first_sched(&self) -> Option<Uid> {
        self.by_sched.top()
    }

    pub fn by_score(&self, opinion: Opinion) -> &PriorityMap<Score> {
        &self.by_score[opinion.idx()]
    }

    pub fn by_sched(&self) -> &PriorityMap<Timestamp> {
        &self.by_sched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Profile, Sex};

    fn prof(opinion: Opinion) -> Profile {
        Profile {
            name: "x".into(),
            sex: Sex::Male,
            opinion,
        }
    }

    fn waiting(uid: i64, opinion: Opinion, until: i64, waiting_for: Option<Uid>) -> UserState {
        UserState::Waiting {
            uid: Uid(uid),
            profile: prof(opinion),
            searching_until: Timestamp::from_secs(until),
            next_refresh: Timestamp::from_secs(until),
            waiting_for,
        }
    }

    fn asking(uid: i64, opinion: Opinion, asking_until: i64, waited_by: Option<Uid>) -> UserState {
        UserState::Asking {
            uid: Uid(uid),
            profile: prof(opinion),
            searching_until: Timestamp::from_secs(asking_until + 10),
            next_refresh: Timestamp::from_secs(asking_until),
            asked_uid: Uid(0),
            asking_until: Timestamp::from_secs(asking_until),
            waited_by,
        }
    }

    fn active(uid: i64, opinion: Opinion, since: i64) -> UserState {
        UserState::Active {
            uid: Uid(uid),
            profile: prof(opinion),
            since: Timestamp::from_secs(since),
        }
    }

    #[test]
    fn test_priority_map_top_is_minimum() {
        let mut pm = PriorityMap::new();
        pm.upsert(Uid(1), (2u8, 5i64));
        pm.upsert(Uid(2), (1, 9));
        pm.upsert(Uid(3), (1, 3));
        assert_eq!(pm.top(), Some(Uid(3)));
        pm.remove(Uid(3));
        assert_eq!(pm.top(), Some(Uid(2)));
    }

    #[test]
    fn test_priority_map_upsert_replaces() {
        let mut pm = PriorityMap::new();
        pm.upsert(Uid(1), (1u8, 1i64));
        pm.upsert(Uid(1), (3, 1));
        assert_eq!(pm.len(), 1);
        pm.upsert(Uid(2), (2, 1));
        assert_eq!(pm.top(), Some(Uid(2)));
    }

    #[test]
    fn test_priority_map_ties_break_by_uid() {
        let mut pm = PriorityMap::new();
        pm.upsert(Uid(9), (1u8, 7i64));
        pm.upsert(Uid(4), (1, 7));
        assert_eq!(pm.top(), Some(Uid(4)));
    }

    // Mirrors the ordering the protocol promises: waiting searchers first by
    // deadline, then unreserved askers, then actives most-recent-first.
    #[test]
    fn test_search_score_ordering() {
        let states = [
            active(2, Opinion::Pro, 1),
            active(3, Opinion::Pro, 2),
            waiting(4, Opinion::Pro, 2, Some(Uid(10))),
            waiting(5, Opinion::Pro, 3, None),
            asking(6, Opinion::Pro, 2, None),
            asking(7, Opinion::Pro, 3, None),
        ];
        let mut scored: Vec<(Score, Uid)> = states
            .iter()
            .filter_map(|s| search_score(s, Opinion::Pro).map(|sc| (sc, s.uid())))
            .collect();
        scored.sort();
        let order: Vec<i64> = scored.iter().map(|&(_, Uid(n))| n).collect();
        assert_eq!(order, vec![4, 5, 6, 7, 3, 2]);
    }

    #[test]
    fn test_search_score_excludes_reserved_and_wrong_opinion() {
        let reserved = asking(8, Opinion::Pro, 10, Some(Uid(3)));
        assert_eq!(search_score(&reserved, Opinion::Pro), None);

        let con = waiting(9, Opinion::Con, 10, None);
        assert_eq!(search_score(&con, Opinion::Pro), None);

        let unregistered = UserState::Initial { uid: Uid(10) };
        assert_eq!(search_score(&unregistered, Opinion::Pro), None);
    }

    #[test]
    fn test_indices_update_adds_and_removes() {
        let mut idx = Indices::new();
        let w = waiting(1, Opinion::Pro, 30, None);
        idx.update(&w);
        assert_eq!(idx.best_candidate(Opinion::Pro), Some(Uid(1)));
        assert_eq!(idx.first_sched(), Some(Uid(1)));

        // Transitioning to Inactive without a survey drops both entries.
        idx.update(&UserState::Inactive {
            uid: Uid(1),
            profile: prof(Opinion::Pro),
            survey_at: None,
        });
        assert_eq!(idx.best_candidate(Opinion::Pro), None);
        assert_eq!(idx.first_sched(), None);
    }

    #[test]
    fn test_indices_idempotent_set() {
        let mut idx = Indices::new();
        let w = waiting(1, Opinion::Con, 30, None);
        idx.update(&w);
        let sched_before = idx.by_sched().get(Uid(1));
        idx.update(&w);
        assert_eq!(idx.by_sched().get(Uid(1)), sched_before);
        assert_eq!(idx.by_score(Opinion::Con).len(), 1);
        assert_eq!(idx.by_sched().len(), 1);
    }
}
