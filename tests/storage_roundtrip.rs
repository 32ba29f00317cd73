//! Persistence round-trip: everything written through a commit batch comes
//! back identical on the next boot, and a second process cannot take over a
//! live database file.

use tempfile::TempDir;

use parley::clock::Timestamp;
use parley::engine::store::{CommitBatch, LogEvent};
use parley::model::{Opinion, Profile, Sex, Uid, UserState};
use parley::storage::Storage;

fn db_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("parley.db").display())
}

fn prof(n: i64, opinion: Opinion) -> Profile {
    Profile {
        name: format!("user {n}"),
        sex: if n % 2 == 0 { Sex::Female } else { Sex::Male },
        opinion,
    }
}

fn sample_states() -> Vec<UserState> {
    let ts = Timestamp::from_secs;
    vec![
        UserState::WaitingForOpinion {
            uid: Uid(1),
            display_name: "Dana L".into(),
        },
        UserState::WaitingForName {
            uid: Uid(2),
            name: "Avi".into(),
            sex: Sex::Male,
            opinion: Opinion::Con,
        },
        UserState::Inactive {
            uid: Uid(3),
            profile: prof(3, Opinion::Pro),
            survey_at: Some(ts(600)),
        },
        UserState::Asking {
            uid: Uid(4),
            profile: prof(4, Opinion::Con),
            searching_until: ts(100),
            next_refresh: ts(45),
            asked_uid: Uid(5),
            asking_until: ts(59),
            waited_by: Some(Uid(6)),
        },
        UserState::Asked {
            uid: Uid(5),
            profile: prof(5, Opinion::Pro),
            until: ts(59),
            asked_by: Uid(4),
        },
        UserState::Waiting {
            uid: Uid(6),
            profile: prof(6, Opinion::Pro),
            searching_until: ts(120),
            next_refresh: ts(50),
            waiting_for: Some(Uid(4)),
        },
        UserState::Active {
            uid: Uid(7),
            profile: prof(7, Opinion::Con),
            since: ts(40),
        },
    ]
}

#[tokio::test]
async fn states_roundtrip_through_sqlite() {
    let dir = TempDir::new().unwrap();
    let url = db_url(&dir);
    let states = sample_states();

    {
        let storage = Storage::open(&url).await.unwrap();
        storage
            .persist_batch(&CommitBatch {
                states: states.clone(),
                events: vec![LogEvent {
                    ts: Timestamp::from_secs(1),
                    kind: "boot",
                    data: serde_json::json!({ "states": states.len() }),
                }],
            })
            .await
            .unwrap();
    }

    let storage = Storage::open(&url).await.unwrap();
    let mut loaded = storage.load_all().await.unwrap();
    loaded.sort_by_key(|s| s.uid().0);
    assert_eq!(loaded, states);
}

#[tokio::test]
async fn upsert_keeps_one_row_per_uid() {
    let dir = TempDir::new().unwrap();
    let url = db_url(&dir);
    let storage = Storage::open(&url).await.unwrap();

    let first = UserState::Active {
        uid: Uid(9),
        profile: prof(9, Opinion::Pro),
        since: Timestamp::from_secs(10),
    };
    let second = UserState::Inactive {
        uid: Uid(9),
        profile: prof(9, Opinion::Pro),
        survey_at: None,
    };
    for state in [&first, &second] {
        storage
            .persist_batch(&CommitBatch {
                states: vec![(*state).clone()],
                events: Vec::new(),
            })
            .await
            .unwrap();
    }

    let loaded = storage.load_all().await.unwrap();
    assert_eq!(loaded, vec![second]);
}

#[tokio::test]
async fn second_owner_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let url = db_url(&dir);
    let first = Storage::open(&url).await.unwrap();
    // Lock is claimed by the first owner's schema writes; a second open must
    // fail instead of silently sharing the dataset.
    let second = Storage::open(&url).await;
    assert!(second.is_err(), "second owner unexpectedly acquired the database");
    drop(first);
}
