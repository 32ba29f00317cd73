//! The matching state machine.
//!
//! Pure dispatch: given the current state, a normalized input and an explicit
//! timestamp, produce state transitions through the transaction and an
//! ordered list of outbound messages. The matcher never reads the clock, never
//! performs I/O, and is never entered concurrently (the driver serializes
//! invocations), so there is no locking anywhere in here.
//!
//! Cross-user invariants (an `Asking` always has its `Asked`, a reservation
//! always links both ways) are asserted on every navigation; a violation
//! means this process's state is corrupt and we crash loudly rather than
//! keep matching on top of it.

use serde_json::json;

use crate::clock::{Duration, Timestamp};
use crate::model::{Cmd, Profile, Uid, UserState};

use super::outbound::{MessageKind, OutboundMessage};
use super::store::Tx;

/// How long a candidate has to answer "are you available?".
pub const ASKING_DURATION: Duration = Duration::from_secs(19);
/// Total search window for a newly-available user.
pub const SEARCH_DURATION: Duration = Duration::from_secs(60);
/// Countdown refresh cadence; must divide `SEARCH_DURATION`.
pub const SEARCH_UPDATE_INTERVAL: Duration = Duration::from_secs(5);
/// Delay until the post-call survey prompt.
pub const SURVEY_DURATION: Duration = Duration::from_secs(60);

const _: () = assert!(SEARCH_DURATION.as_secs() % SEARCH_UPDATE_INTERVAL.as_secs() == 0);

/// A normalized input for one user, as produced by the adapter or the
/// scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `/start`: force-reset to registration.
    Start { display_name: String },
    /// Free-text reply; only meaningful while a name is awaited.
    Text { text: String },
    /// Button press. `None` means the callback data was unrecognized.
    Callback { cmd: Option<Cmd> },
    /// Synthetic wake-up from the scheduler.
    Tick,
}

/// Top-level dispatch. Returns the messages to deliver, in order; all state
/// changes have been applied to `tx` by the time this returns.
pub fn handle_input(tx: &mut Tx, ts: Timestamp, uid: Uid, input: Input) -> Vec<OutboundMessage> {
    match input {
        Input::Start { display_name } => handle_start(tx, ts, uid, display_name),
        Input::Tick => {
            // Re-read the state: the tick may have been scheduled for a
            // deadline that has since moved or disappeared.
            let state = tx.get(uid);
            match state.sched() {
                Some(at) if at <= ts => dispatch_cmd(tx, ts, state, Cmd::Sched),
                _ => {
                    tx.log("tick_discarded", json!({ "uid": uid }));
                    Vec::new()
                }
            }
        }
        Input::Callback { cmd: None } => unexpected(tx, uid),
        Input::Callback { cmd: Some(cmd) } => {
            let state = tx.get(uid);
            dispatch_cmd(tx, ts, state, cmd)
        }
        Input::Text { text } => {
            let state = tx.get(uid);
            match state {
                UserState::Initial { .. } => handle_start(tx, ts, uid, String::new()),
                UserState::WaitingForName { sex, opinion, .. } => {
                    let name = text.trim();
                    if name.is_empty() {
                        return unexpected(tx, uid);
                    }
                    tx.set(UserState::Inactive {
                        uid,
                        profile: Profile {
                            name: name.to_string(),
                            sex,
                            opinion,
                        },
                        survey_at: None,
                    });
                    vec![
                        OutboundMessage::new(uid, MessageKind::Registered),
                        OutboundMessage::new(uid, MessageKind::Inactive),
                    ]
                }
                _ => unexpected(tx, uid),
            }
        }
    }
}

fn dispatch_cmd(tx: &mut Tx, ts: Timestamp, state: UserState, cmd: Cmd) -> Vec<OutboundMessage> {
    match state {
        UserState::Initial { uid } => handle_start(tx, ts, uid, String::new()),
        UserState::WaitingForOpinion { uid, display_name } => {
            match cmd.opinion_choice() {
                Some((sex, opinion)) => {
                    tx.set(UserState::WaitingForName {
                        uid,
                        name: display_name,
                        sex,
                        opinion,
                    });
                    vec![OutboundMessage::new(uid, MessageKind::TypeName)]
                }
                None => unexpected(tx, uid),
            }
        }
        // Expecting a typed name, not a button press.
        UserState::WaitingForName { uid, .. } => unexpected(tx, uid),
        UserState::Inactive { uid, profile, .. } => handle_inactive(tx, ts, uid, profile, cmd),
        UserState::Active { uid, profile, .. } => handle_active(tx, ts, uid, profile, cmd),
        state @ (UserState::Asking { .. } | UserState::Waiting { .. }) => {
            handle_searching(tx, ts, state, cmd)
        }
        state @ UserState::Asked { .. } => handle_asked(tx, ts, state, cmd),
    }
}

/// `/start` from any state: back to registration. Any in-flight links are
/// released first so the partners are not left pointing at a user who just
/// restarted.
fn handle_start(tx: &mut Tx, ts: Timestamp, uid: Uid, display_name: String) -> Vec<OutboundMessage> {
    let prior = tx.get(uid);
    tx.set(UserState::WaitingForOpinion { uid, display_name });
    let mut msgs = vec![
        OutboundMessage::new(uid, MessageKind::Welcome),
        OutboundMessage::new(uid, MessageKind::AskOpinion),
    ];
    match prior {
        UserState::Asking { .. } | UserState::Waiting { .. } => {
            release_search_links(tx, ts, &prior, &mut msgs);
        }
        UserState::Asked { asked_by, .. } => {
            tx.log("restart_while_asked", json!({ "uid": uid, "asked_by": asked_by }));
            research_asker(tx, ts, asked_by, &mut msgs);
        }
        _ => {}
    }
    msgs
}

fn handle_inactive(
    tx: &mut Tx,
    ts: Timestamp,
    uid: Uid,
    profile: Profile,
    cmd: Cmd,
) -> Vec<OutboundMessage> {
    match cmd {
        Cmd::ImAvailableNow => {
            let state = tx.get(uid);
            let (found, mut msgs) = search_for_match(tx, ts, &state);
            if !found {
                msgs.push(OutboundMessage::new(uid, MessageKind::Searching));
            }
            msgs
        }
        // The survey timer fired.
        Cmd::Sched => {
            tx.set(UserState::Inactive {
                uid,
                profile,
                survey_at: None,
            });
            vec![OutboundMessage::new(uid, MessageKind::HowWasTheCall)]
        }
        reply if reply.is_survey_reply() => {
            vec![OutboundMessage::new(uid, MessageKind::ThanksForAnswering { reply })]
        }
        _ => unexpected(tx, uid),
    }
}

fn handle_active(
    tx: &mut Tx,
    ts: Timestamp,
    uid: Uid,
    profile: Profile,
    cmd: Cmd,
) -> Vec<OutboundMessage> {
    match cmd {
        Cmd::ImAvailableNow => {
            let state = tx.get(uid);
            let (found, mut msgs) = search_for_match(tx, ts, &state);
            if !found {
                msgs.push(OutboundMessage::new(uid, MessageKind::Searching));
            }
            msgs
        }
        Cmd::ImNoLongerAvailable => {
            tx.set(UserState::Inactive {
                uid,
                profile,
                survey_at: None,
            });
            vec![OutboundMessage::new(uid, MessageKind::AfterReplyUnavailable)]
        }
        _ => unexpected(tx, uid),
    }
}

/// `Asking` or `Waiting`: countdown refresh, search timeout, or manual stop.
fn handle_searching(tx: &mut Tx, ts: Timestamp, state: UserState, cmd: Cmd) -> Vec<OutboundMessage> {
    let uid = state.uid();
    let (searching_until, _) = state
        .searching_window()
        .unwrap_or_else(|| panic!("handle_searching on non-searching state for {uid}"));
    match cmd {
        Cmd::Sched if searching_until > ts => {
            let next_refresh = (ts + SEARCH_UPDATE_INTERVAL).min(searching_until);
            tx.set(with_next_refresh(state, next_refresh));
            let left = (searching_until - ts).as_secs();
            vec![OutboundMessage::new(
                uid,
                MessageKind::UpdateSearching {
                    seconds_left: round_up(left, SEARCH_UPDATE_INTERVAL.as_secs()),
                },
            )]
        }
        Cmd::Sched | Cmd::StopSearching => {
            let profile = state
                .profile()
                .cloned()
                .unwrap_or_else(|| panic!("searching state without profile for {uid}"));
            let mut msgs = if cmd == Cmd::Sched {
                tx.set(UserState::Active {
                    uid,
                    profile,
                    since: ts,
                });
                vec![OutboundMessage::new(uid, MessageKind::SearchTimedOut)]
            } else {
                tx.set(UserState::Inactive {
                    uid,
                    profile,
                    survey_at: None,
                });
                vec![OutboundMessage::new(uid, MessageKind::AfterStopSearch)]
            };
            release_search_links(tx, ts, &state, &mut msgs);
            msgs
        }
        _ => unexpected(tx, uid),
    }
}

/// An `Asked` user answered, or their deadline fired.
fn handle_asked(tx: &mut Tx, ts: Timestamp, state: UserState, cmd: Cmd) -> Vec<OutboundMessage> {
    let UserState::Asked {
        uid,
        profile,
        asked_by,
        ..
    } = state
    else {
        panic!("handle_asked on non-asked state");
    };
    match cmd {
        Cmd::AnswerAvailable => {
            let other = tx.get(asked_by);
            let UserState::Asking {
                profile: other_profile,
                waited_by,
                ..
            } = other.clone()
            else {
                panic!("asked_by of {uid} is {asked_by} but that user is not asking");
            };
            let mut msgs = vec![
                found_partner(uid, asked_by, &other_profile),
                found_partner(asked_by, uid, &profile),
            ];
            tx.set(UserState::Inactive {
                uid,
                profile,
                survey_at: Some(ts + SURVEY_DURATION),
            });
            tx.set(UserState::Inactive {
                uid: asked_by,
                profile: other_profile,
                survey_at: Some(ts + SURVEY_DURATION),
            });
            // The runner-up, if any, resumes searching only after the
            // hand-off above is fully visible.
            if let Some(w) = waited_by {
                let waiting = tx.get(w);
                debug_assert!(matches!(waiting, UserState::Waiting { .. }));
                let (_found, more) = search_for_match(tx, ts, &waiting);
                msgs.extend(more);
            }
            msgs
        }
        Cmd::AnswerUnavailable | Cmd::Sched => {
            tx.set(UserState::Inactive {
                uid,
                profile,
                survey_at: None,
            });
            let kind = if cmd == Cmd::AnswerUnavailable {
                MessageKind::AfterReplyUnavailable
            } else {
                MessageKind::AfterAskingTimedOut
            };
            let mut msgs = vec![OutboundMessage::new(uid, kind)];
            research_asker(tx, ts, asked_by, &mut msgs);
            msgs
        }
        _ => unexpected(tx, uid),
    }
}

/// The asked user is gone (declined, timed out, or restarted); give the
/// asker a fresh search over the same window.
fn research_asker(tx: &mut Tx, ts: Timestamp, asked_by: Uid, msgs: &mut Vec<OutboundMessage>) {
    let asker = tx.get(asked_by);
    let UserState::Asking { waited_by, .. } = asker else {
        panic!("expected {asked_by} to be asking");
    };
    // Release the runner-up link before the asker searches again: the search
    // may pair the asker with someone else, and the runner-up must not be
    // left pointing at a user who is no longer asking. The runner-up keeps
    // its searching window and stays a top-priority candidate.
    let asker = if let Some(w) = waited_by {
        let waiting = tx.get(w);
        let UserState::Waiting {
            uid: w_uid,
            profile: w_profile,
            searching_until,
            next_refresh,
            waiting_for,
        } = waiting
        else {
            panic!("waited_by of {asked_by} is {w} but that user is not waiting");
        };
        debug_assert_eq!(waiting_for, Some(asked_by));
        tx.set(UserState::Waiting {
            uid: w_uid,
            profile: w_profile,
            searching_until,
            next_refresh,
            waiting_for: None,
        });
        with_waited_by(tx.get(asked_by), None)
    } else {
        tx.get(asked_by)
    };
    let (_found, more) = search_for_match(tx, ts, &asker);
    msgs.extend(more);
}

/// Undo the links of a searching state that is being torn down: the asked
/// partner is released (and told), the runner-up re-searches, a reservation
/// we held on someone else's ask is cleared.
fn release_search_links(
    tx: &mut Tx,
    ts: Timestamp,
    old: &UserState,
    msgs: &mut Vec<OutboundMessage>,
) {
    match *old {
        UserState::Asking {
            uid,
            asked_uid,
            waited_by,
            ..
        } => {
            let asked = tx.get(asked_uid);
            let UserState::Asked {
                profile: asked_profile,
                asked_by,
                ..
            } = asked
            else {
                panic!("asked_uid of {uid} is {asked_uid} but that user is not asked");
            };
            debug_assert_eq!(asked_by, uid);
            tx.set(UserState::Inactive {
                uid: asked_uid,
                profile: asked_profile,
                survey_at: None,
            });
            msgs.push(OutboundMessage::new(asked_uid, MessageKind::AfterAskingTimedOut));
            if let Some(w) = waited_by {
                let waiting = tx.get(w);
                debug_assert!(matches!(waiting, UserState::Waiting { .. }));
                let (_found, more) = search_for_match(tx, ts, &waiting);
                msgs.extend(more);
            }
        }
        UserState::Waiting {
            waiting_for: Some(a),
            ..
        } => {
            let asking = tx.get(a);
            tx.set(with_waited_by(asking, None));
        }
        UserState::Waiting { .. } => {}
        _ => panic!("release_search_links on non-searching state"),
    }
}

/// Look for the best opposing candidate for `state` and act on what we find.
/// Returns `(found, msgs)`; `found` means an immediate match happened and the
/// caller should not show a "searching" placeholder.
pub(crate) fn search_for_match(
    tx: &mut Tx,
    ts: Timestamp,
    state: &UserState,
) -> (bool, Vec<OutboundMessage>) {
    let uid = state.uid();
    let profile = state
        .profile()
        .cloned()
        .unwrap_or_else(|| panic!("search_for_match on unregistered state for {uid}"));
    // A user already searching keeps their window; a fresh search opens one.
    let (searching_until, next_refresh) = state
        .searching_window()
        .unwrap_or((ts + SEARCH_DURATION, ts + SEARCH_UPDATE_INTERVAL));

    match tx.search_for_user(profile.opinion.opposite()) {
        // Another searcher: immediate match.
        Some(UserState::Waiting {
            uid: other_uid,
            profile: other_profile,
            waiting_for,
            ..
        }) => {
            if let Some(reserved) = waiting_for {
                // They were runner-up behind an ask; break that reservation.
                let asking = tx.get(reserved);
                tx.set(with_waited_by(asking, None));
            }
            tx.set(UserState::Inactive {
                uid,
                profile: profile.clone(),
                survey_at: Some(ts + SURVEY_DURATION),
            });
            tx.set(UserState::Inactive {
                uid: other_uid,
                profile: other_profile.clone(),
                survey_at: Some(ts + SURVEY_DURATION),
            });
            (
                true,
                vec![
                    found_partner(uid, other_uid, &other_profile),
                    found_partner(other_uid, uid, &profile),
                ],
            )
        }
        // Someone mid-ask with no runner-up yet: reserve them if our window
        // outlasts their ask deadline.
        Some(UserState::Asking {
            uid: other_uid,
            profile: other_profile,
            searching_until: other_searching_until,
            next_refresh: other_next_refresh,
            asked_uid,
            asking_until,
            waited_by,
        }) => {
            debug_assert!(waited_by.is_none());
            if asking_until <= searching_until {
                tx.set(UserState::Waiting {
                    uid,
                    profile,
                    searching_until,
                    next_refresh,
                    waiting_for: Some(other_uid),
                });
                tx.set(UserState::Asking {
                    uid: other_uid,
                    profile: other_profile,
                    searching_until: other_searching_until,
                    next_refresh: other_next_refresh,
                    asked_uid,
                    asking_until,
                    waited_by: Some(uid),
                });
            } else {
                tx.set(UserState::Waiting {
                    uid,
                    profile,
                    searching_until,
                    next_refresh,
                    waiting_for: None,
                });
            }
            (false, Vec::new())
        }
        // A passive candidate: promote to an ask if the deadline fits.
        Some(UserState::Active {
            uid: other_uid,
            profile: other_profile,
            ..
        }) => {
            let asking_until = ts + ASKING_DURATION;
            if asking_until <= searching_until {
                tx.set(UserState::Asking {
                    uid,
                    profile: profile.clone(),
                    searching_until,
                    next_refresh,
                    asked_uid: other_uid,
                    asking_until,
                    waited_by: None,
                });
                tx.set(UserState::Asked {
                    uid: other_uid,
                    profile: other_profile,
                    until: asking_until,
                    asked_by: uid,
                });
                (
                    false,
                    vec![OutboundMessage::new(
                        other_uid,
                        MessageKind::AreYouAvailable {
                            other_sex: profile.sex,
                        },
                    )],
                )
            } else {
                tx.set(UserState::Waiting {
                    uid,
                    profile,
                    searching_until,
                    next_refresh,
                    waiting_for: None,
                });
                (false, Vec::new())
            }
        }
        None => {
            tx.set(UserState::Waiting {
                uid,
                profile,
                searching_until,
                next_refresh,
                waiting_for: None,
            });
            (false, Vec::new())
        }
        Some(other) => panic!("search index returned ineligible state {other:?}"),
    }
}

fn found_partner(to: Uid, other_uid: Uid, other: &Profile) -> OutboundMessage {
    OutboundMessage::new(
        to,
        MessageKind::FoundPartner {
            other_uid,
            other_name: other.name.clone(),
            other_sex: other.sex,
        },
    )
}

fn unexpected(tx: &mut Tx, uid: Uid) -> Vec<OutboundMessage> {
    tx.log("unexpected", json!({ "uid": uid }));
    vec![OutboundMessage::new(uid, MessageKind::Unexpected)]
}

/// Smallest multiple of `m` that is >= `n`.
fn round_up(n: i64, m: i64) -> i64 {
    n + (-n).rem_euclid(m)
}

fn with_next_refresh(state: UserState, next_refresh: Timestamp) -> UserState {
    match state {
        UserState::Asking {
            uid,
            profile,
            searching_until,
            asked_uid,
            asking_until,
            waited_by,
            ..
        } => UserState::Asking {
            uid,
            profile,
            searching_until,
            next_refresh,
            asked_uid,
            asking_until,
            waited_by,
        },
        UserState::Waiting {
            uid,
            profile,
            searching_until,
            waiting_for,
            ..
        } => UserState::Waiting {
            uid,
            profile,
            searching_until,
            next_refresh,
            waiting_for,
        },
        other => panic!("with_next_refresh on non-searching state {other:?}"),
    }
}

fn with_waited_by(state: UserState, waited_by: Option<Uid>) -> UserState {
    match state {
        UserState::Asking {
            uid,
            profile,
            searching_until,
            next_refresh,
            asked_uid,
            asking_until,
            ..
        } => UserState::Asking {
            uid,
            profile,
            searching_until,
            next_refresh,
            asked_uid,
            asking_until,
            waited_by,
        },
        other => panic!("expected an asking state, got {other:?}"),
    }
}
