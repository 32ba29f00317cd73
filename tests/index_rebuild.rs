//! The indices are strictly derived: after any sequence of `set` calls,
//! rebuilding both indices from the bare state map must give exactly what
//! incremental maintenance produced.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use parley::clock::Timestamp;
use parley::engine::index::search_score;
use parley::engine::store::MemStore;
use parley::model::{Opinion, Profile, Sex, Uid, UserState};

fn random_state(rng: &mut StdRng, uid: i64) -> UserState {
    let opinion = if rng.random::<bool>() {
        Opinion::Pro
    } else {
        Opinion::Con
    };
    let sex = if rng.random::<bool>() {
        Sex::Male
    } else {
        Sex::Female
    };
    let profile = Profile {
        name: format!("u{uid}"),
        sex,
        opinion,
    };
    let t = |secs: i64| Timestamp::from_secs(secs);
    let base: i64 = rng.random_range(0..1_000);
    match rng.random_range(0..6) {
        0 => UserState::Initial { uid: Uid(uid) },
        1 => UserState::Inactive {
            uid: Uid(uid),
            profile,
            survey_at: rng.random::<bool>().then(|| t(base + 60)),
        },
        2 => UserState::Active {
            uid: Uid(uid),
            profile,
            since: t(base),
        },
        3 => UserState::Waiting {
            uid: Uid(uid),
            profile,
            searching_until: t(base + 60),
            next_refresh: t(base + rng.random_range(0..=60)),
            waiting_for: rng.random::<bool>().then(|| Uid(rng.random_range(1..50))),
        },
        4 => UserState::Asking {
            uid: Uid(uid),
            profile,
            searching_until: t(base + 60),
            next_refresh: t(base + rng.random_range(0..=60)),
            asked_uid: Uid(rng.random_range(1..50)),
            asking_until: t(base + rng.random_range(0..=60)),
            waited_by: rng.random::<bool>().then(|| Uid(rng.random_range(1..50))),
        },
        _ => UserState::Asked {
            uid: Uid(uid),
            profile,
            until: t(base + 19),
            asked_by: Uid(rng.random_range(1..50)),
        },
    }
}

fn assert_indices_equal(incremental: &MemStore, rebuilt: &MemStore, uids: &[i64]) {
    for &n in uids {
        let uid = Uid(n);
        assert_eq!(
            incremental.indices().by_sched().get(uid),
            rebuilt.indices().by_sched().get(uid),
            "sched entry diverged for {uid}"
        );
        for opinion in Opinion::ALL {
            assert_eq!(
                incremental.indices().by_score(opinion).get(uid),
                rebuilt.indices().by_score(opinion).get(uid),
                "score entry diverged for {uid}"
            );
        }
    }
    for opinion in Opinion::ALL {
        assert_eq!(
            incremental.search_for_user(opinion).map(|s| s.uid()),
            rebuilt.search_for_user(opinion).map(|s| s.uid()),
            "top candidate diverged"
        );
    }
    assert_eq!(
        incremental.first_sched().map(|s| s.uid()),
        rebuilt.first_sched().map(|s| s.uid()),
        "first scheduled diverged"
    );
}

#[test]
fn rebuild_matches_incremental_after_random_sets() {
    let mut rng = StdRng::seed_from_u64(0x9a7_1e);
    let uids: Vec<i64> = (1..30).collect();
    for _round in 0..50 {
        let mut incremental = MemStore::new();
        // A churny history: users get overwritten several times.
        for _ in 0..200 {
            let uid = uids[rng.random_range(0..uids.len())];
            incremental.set(random_state(&mut rng, uid));
        }
        let rebuilt = MemStore::rebuild(incremental.states().cloned().collect::<Vec<_>>());
        assert_indices_equal(&incremental, &rebuilt, &uids);
    }
}

#[test]
fn setting_identical_state_is_a_noop() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut store = MemStore::new();
    for uid in 1..20 {
        store.set(random_state(&mut rng, uid));
    }
    let snapshot: Vec<UserState> = store.states().cloned().collect();
    let before: Vec<_> = snapshot
        .iter()
        .map(|s| {
            (
                s.uid(),
                store.indices().by_sched().get(s.uid()),
                store.indices().by_score(Opinion::Pro).get(s.uid()),
                store.indices().by_score(Opinion::Con).get(s.uid()),
            )
        })
        .collect();
    for state in &snapshot {
        store.set(state.clone());
    }
    let after: Vec<_> = snapshot
        .iter()
        .map(|s| {
            (
                s.uid(),
                store.indices().by_sched().get(s.uid()),
                store.indices().by_score(Opinion::Pro).get(s.uid()),
                store.indices().by_score(Opinion::Con).get(s.uid()),
            )
        })
        .collect();
    assert_eq!(before, after);
}

#[test]
fn index_contains_exactly_the_eligible() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut store = MemStore::new();
    for uid in 1..40 {
        store.set(random_state(&mut rng, uid));
    }
    for state in store.states() {
        for opinion in Opinion::ALL {
            let expected = search_score(state, opinion);
            assert_eq!(
                store.indices().by_score(opinion).get(state.uid()),
                expected,
                "membership mismatch for {}",
                state.uid()
            );
        }
        assert_eq!(store.indices().by_sched().get(state.uid()), state.sched());
    }
}
