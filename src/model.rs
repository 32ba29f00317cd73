//! The per-user state model.
//!
//! `UserState` is a closed tagged union: exactly one variant is active per
//! `Uid`, states are immutable values, and every transition happens inside a
//! transaction via the matcher. Cross-user links (`asked_by`, `asked_uid`,
//! `waited_by`, `waiting_for`) are `Uid` indirections, never references; all
//! navigation goes through the store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Telegram user id; the primary key for everything.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub i64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opinion {
    Pro,
    Con,
}

impl Opinion {
    pub fn opposite(self) -> Opinion {
        match self {
            Opinion::Pro => Opinion::Con,
            Opinion::Con => Opinion::Pro,
        }
    }

    /// Index into per-opinion tables.
    pub fn idx(self) -> usize {
        match self {
            Opinion::Pro => 0,
            Opinion::Con => 1,
        }
    }

    pub const ALL: [Opinion; 2] = [Opinion::Pro, Opinion::Con];
}

/// The closed command set a user (or the scheduler) can produce.
///
/// `Sched` is synthetic: it is produced only by the scheduler driver when a
/// user's `sched` timestamp fires, and has no callback token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cmd {
    OpinionMalePro,
    OpinionMaleCon,
    OpinionFemalePro,
    OpinionFemaleCon,
    ImAvailableNow,
    StopSearching,
    ImNoLongerAvailable,
    AnswerAvailable,
    AnswerUnavailable,
    Sched,
    S1,
    S2,
    S3,
    S4,
    S5,
    SDidntTalk,
    SNoAnswer,
}

impl Cmd {
    /// Wire token used as inline-keyboard `callback_data`.
    pub fn callback_data(self) -> Option<&'static str> {
        Some(match self {
            Cmd::OpinionMalePro => "opinion_male_pro",
            Cmd::OpinionMaleCon => "opinion_male_con",
            Cmd::OpinionFemalePro => "opinion_female_pro",
            Cmd::OpinionFemaleCon => "opinion_female_con",
            Cmd::ImAvailableNow => "available_now",
            Cmd::StopSearching => "stop_searching",
            Cmd::ImNoLongerAvailable => "no_longer_available",
            Cmd::AnswerAvailable => "answer_available",
            Cmd::AnswerUnavailable => "answer_unavailable",
            Cmd::S1 => "s1",
            Cmd::S2 => "s2",
            Cmd::S3 => "s3",
            Cmd::S4 => "s4",
            Cmd::S5 => "s5",
            Cmd::SDidntTalk => "s_didnt_talk",
            Cmd::SNoAnswer => "s_no_answer",
            Cmd::Sched => return None,
        })
    }

    /// Inverse of [`Cmd::callback_data`]. Unknown tokens return `None`;
    /// `Sched` is deliberately not parseable from the wire.
    pub fn from_callback_data(data: &str) -> Option<Cmd> {
        const EXTERNAL: [Cmd; 16] = [
            Cmd::OpinionMalePro,
            Cmd::OpinionMaleCon,
            Cmd::OpinionFemalePro,
            Cmd::OpinionFemaleCon,
            Cmd::ImAvailableNow,
            Cmd::StopSearching,
            Cmd::ImNoLongerAvailable,
            Cmd::AnswerAvailable,
            Cmd::AnswerUnavailable,
            Cmd::S1,
            Cmd::S2,
            Cmd::S3,
            Cmd::S4,
            Cmd::S5,
            Cmd::SDidntTalk,
            Cmd::SNoAnswer,
        ];
        EXTERNAL.into_iter().find(|c| c.callback_data() == Some(data))
    }

    /// The four opinion-choice commands carry a (sex, opinion) pair.
    pub fn opinion_choice(self) -> Option<(Sex, Opinion)> {
        match self {
            Cmd::OpinionMalePro => Some((Sex::Male, Opinion::Pro)),
            Cmd::OpinionMaleCon => Some((Sex::Male, Opinion::Con)),
            Cmd::OpinionFemalePro => Some((Sex::Female, Opinion::Pro)),
            Cmd::OpinionFemaleCon => Some((Sex::Female, Opinion::Con)),
            _ => None,
        }
    }

    pub fn is_survey_reply(self) -> bool {
        matches!(
            self,
            Cmd::S1 | Cmd::S2 | Cmd::S3 | Cmd::S4 | Cmd::S5 | Cmd::SDidntTalk | Cmd::SNoAnswer
        )
    }
}

/// Fields shared by every registered variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub sex: Sex,
    pub opinion: Opinion,
}

/// The per-user state machine, one active variant per `Uid`.
///
/// `Initial` is virtual: `get` on a missing row returns it and it is never
/// persisted. The `type` discriminator is the persisted row format; renaming
/// a variant is a data migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserState {
    Initial {
        uid: Uid,
    },
    WaitingForOpinion {
        uid: Uid,
        display_name: String,
    },
    WaitingForName {
        uid: Uid,
        name: String,
        sex: Sex,
        opinion: Opinion,
    },
    Inactive {
        uid: Uid,
        #[serde(flatten)]
        profile: Profile,
        /// When set, a post-call survey prompt fires at this time.
        survey_at: Option<Timestamp>,
    },
    /// Searching, with an "are you available?" outstanding to `asked_uid`.
    Asking {
        uid: Uid,
        #[serde(flatten)]
        profile: Profile,
        searching_until: Timestamp,
        next_refresh: Timestamp,
        asked_uid: Uid,
        asking_until: Timestamp,
        /// The searcher that reserved us as their runner-up, if any.
        waited_by: Option<Uid>,
    },
    /// Searching, not asking anyone; possibly runner-up behind an `Asking`.
    Waiting {
        uid: Uid,
        #[serde(flatten)]
        profile: Profile,
        searching_until: Timestamp,
        next_refresh: Timestamp,
        waiting_for: Option<Uid>,
    },
    /// Searched without success; passively eligible to be asked.
    Active {
        uid: Uid,
        #[serde(flatten)]
        profile: Profile,
        since: Timestamp,
    },
    /// Received an "are you available?" and must reply before `until`.
    Asked {
        uid: Uid,
        #[serde(flatten)]
        profile: Profile,
        until: Timestamp,
        asked_by: Uid,
    },
}

impl UserState {
    pub fn uid(&self) -> Uid {
        match *self {
            UserState::Initial { uid }
            | UserState::WaitingForOpinion { uid, .. }
            | UserState::WaitingForName { uid, .. }
            | UserState::Inactive { uid, .. }
            | UserState::Asking { uid, .. }
            | UserState::Waiting { uid, .. }
            | UserState::Active { uid, .. }
            | UserState::Asked { uid, .. } => uid,
        }
    }

    /// The next wake-up for this user, if any. This keys the scheduled heap.
    pub fn sched(&self) -> Option<Timestamp> {
        match *self {
            UserState::Inactive { survey_at, .. } => survey_at,
            UserState::Asking { next_refresh, .. } => Some(next_refresh),
            UserState::Waiting { next_refresh, .. } => Some(next_refresh),
            UserState::Asked { until, .. } => Some(until),
            _ => None,
        }
    }

    pub fn profile(&self) -> Option<&Profile> {
        match self {
            UserState::Inactive { profile, .. }
            | UserState::Asking { profile, .. }
            | UserState::Waiting { profile, .. }
            | UserState::Active { profile, .. }
            | UserState::Asked { profile, .. } => Some(profile),
            _ => None,
        }
    }

    /// `(searching_until, next_refresh)` for the two searching variants.
    pub fn searching_window(&self) -> Option<(Timestamp, Timestamp)> {
        match *self {
            UserState::Asking {
                searching_until,
                next_refresh,
                ..
            }
            | UserState::Waiting {
                searching_until,
                next_refresh,
                ..
            } => Some((searching_until, next_refresh)),
            _ => None,
        }
    }

    /// Audience for rendering: gendered/opinionated text needs both.
    pub fn audience(&self) -> Option<(Sex, Opinion)> {
        match self {
            UserState::WaitingForName { sex, opinion, .. } => Some((*sex, *opinion)),
            _ => self.profile().map(|p| (p.sex, p.opinion)),
        }
    }
}
