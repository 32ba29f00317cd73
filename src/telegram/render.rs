//! Rendering: abstract `MessageKind` values to concrete text, inline
//! keyboards and entities.
//!
//! Templates carry inline variants that are resolved per recipient:
//! `[a|b]` picks by opinion (supporter-side first), `[a/b]` picks by sex
//! (male first), `[a/b|c/d]` by both. The engine never sees any of this.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::engine::outbound::MessageKind;
use crate::model::{Cmd, Opinion, Sex, Uid};

use super::models::{EntityUser, MessageEntity};

/// A rendered message, ready to be turned into an API payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    /// Inline keyboard rows; `None` renders without a keyboard.
    pub keyboard: Option<Vec<Vec<Cmd>>>,
    pub entities: Vec<MessageEntity>,
    /// Asks the client to open a reply prompt (used when a typed answer is
    /// expected).
    pub expects_reply: bool,
}

impl Rendered {
    fn plain(text: String) -> Self {
        Rendered {
            text,
            keyboard: None,
            entities: Vec::new(),
            expects_reply: false,
        }
    }

    fn with_keyboard(text: String, rows: Vec<Vec<Cmd>>) -> Self {
        Rendered {
            text,
            keyboard: Some(rows),
            entities: Vec::new(),
            expects_reply: false,
        }
    }
}

/// Rendering audience: who the message is shown to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Audience {
    pub sex: Sex,
    pub opinion: Opinion,
}

static ELEMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.+?)\]").expect("template regex is valid"));

/// Resolve one bracketed element. `None` for malformed templates.
fn adjust_element(element: &str, sex: Sex, opinion: Opinion) -> Option<String> {
    let op = match opinion {
        Opinion::Pro => 0,
        Opinion::Con => 1,
    };
    let sx = match sex {
        Sex::Male => 0,
        Sex::Female => 1,
    };
    if element.contains('|') {
        let parts: Vec<&str> = element.split('|').collect();
        if parts.len() != 2 {
            return None;
        }
        if parts[0].contains('/') {
            let nested: Vec<Vec<&str>> = parts.iter().map(|p| p.split('/').collect()).collect();
            if nested.iter().any(|p| p.len() != 2) {
                return None;
            }
            Some(nested[op][sx].to_string())
        } else {
            Some(parts[op].to_string())
        }
    } else {
        let parts: Vec<&str> = element.split('/').collect();
        if parts.len() != 2 {
            return None;
        }
        Some(parts[sx].to_string())
    }
}

/// Resolve every `[...]` element in `template` for the given recipient.
/// Malformed elements are left as-is rather than dropped.
pub fn adjust(template: &str, sex: Sex, opinion: Opinion) -> String {
    ELEMENT_RE
        .replace_all(template, |caps: &Captures| {
            adjust_element(&caps[1], sex, opinion).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Telegram measures entity offsets in UTF-16 code units.
fn utf16_len(s: &str) -> i64 {
    s.encode_utf16().count() as i64
}

fn mention(prefix: &str, name: &str, uid: Uid) -> MessageEntity {
    MessageEntity {
        kind: "text_mention",
        offset: utf16_len(prefix),
        length: utf16_len(name),
        user: Some(EntityUser { id: uid.0 }),
    }
}

/// Inline-keyboard label for a command button.
pub fn button_label(cmd: Cmd) -> &'static str {
    match cmd {
        Cmd::OpinionMalePro => "I support the reform \u{1F64B}\u{200D}\u{2642}\u{FE0F}",
        Cmd::OpinionMaleCon => "I oppose the reform \u{1F645}\u{200D}\u{2642}\u{FE0F}",
        Cmd::OpinionFemalePro => "I support the reform \u{1F64B}\u{200D}\u{2640}\u{FE0F}",
        Cmd::OpinionFemaleCon => "I oppose the reform \u{1F645}\u{200D}\u{2640}\u{FE0F}",
        Cmd::ImAvailableNow => "\u{2705} I'm available now",
        Cmd::StopSearching => "Stop searching",
        Cmd::ImNoLongerAvailable => "I'm no longer available",
        Cmd::AnswerAvailable => "\u{2705} I'm available now",
        Cmd::AnswerUnavailable => "\u{274C} Not now",
        Cmd::S1 => "\u{2639}",
        Cmd::S2 => "\u{1F641}",
        Cmd::S3 => "\u{1F610}",
        Cmd::S4 => "\u{1F642}",
        Cmd::S5 => "\u{263A}",
        Cmd::SDidntTalk => "We didn't talk",
        Cmd::SNoAnswer => "Prefer not to answer",
        Cmd::Sched => "",
    }
}

const SEARCHING_TEXT: &str = "Searching...\n\n({} seconds left)";

fn searching_text(seconds_left: i64) -> String {
    SEARCHING_TEXT.replace("{}", &seconds_left.to_string())
}

/// Render `kind` for `uid`. `audience` is the recipient's registered
/// sex/opinion when known; kinds that branch on it are only ever addressed
/// to registered users.
pub fn render(uid: Uid, kind: &MessageKind, audience: Option<Audience>) -> Rendered {
    let (sex, opinion) = audience
        .map(|a| (a.sex, a.opinion))
        .unwrap_or((Sex::Male, Opinion::Pro));
    let adj = |template: &str| adjust(template, sex, opinion);

    match kind {
        MessageKind::Unexpected => Rendered::plain(
            "Sorry, I didn't understand. Could you use one of the buttons on the last message?"
                .to_string(),
        ),
        MessageKind::Welcome => Rendered::plain(
            "Hi! I connect people who oppose the reform with people who support it, \
             for one-on-one voice conversations. If you'd like to talk with someone \
             who sees things differently, I'd be glad to help!"
                .to_string(),
        ),
        MessageKind::AskOpinion => Rendered::with_keyboard(
            "Where do you stand?".to_string(),
            vec![
                vec![Cmd::OpinionFemaleCon, Cmd::OpinionFemalePro],
                vec![Cmd::OpinionMaleCon, Cmd::OpinionMalePro],
            ],
        ),
        MessageKind::TypeName => Rendered {
            text: "No problem. Type the name you'd like me to introduce you by \u{1F447}"
                .to_string(),
            keyboard: None,
            entities: Vec::new(),
            expects_reply: true,
        },
        MessageKind::Registered => Rendered::plain(adj(
            "Thanks, you're registered as [a supporter|an opponent]. \
             (To change anything, send /start and we'll begin again.)",
        )),
        MessageKind::Inactive => Rendered::with_keyboard(
            adj("Are you available now for a call with [an opponent|a supporter]?\n\n\
                 When you press the button, I'll look for [an opponent|a supporter] \
                 who is free to talk right now. If I find one, I'll introduce you to \
                 each other."),
            vec![vec![Cmd::ImAvailableNow]],
        ),
        MessageKind::Searching => {
            Rendered::with_keyboard(searching_text(60), vec![vec![Cmd::StopSearching]])
        }
        MessageKind::UpdateSearching { seconds_left } => Rendered::with_keyboard(
            searching_text(*seconds_left),
            vec![vec![Cmd::StopSearching]],
        ),
        MessageKind::FoundPartner {
            other_uid,
            other_name,
            other_sex,
        } => {
            let intro = match other_sex {
                Sex::Male => adj(
                    "I found [an opponent|a supporter] who would be glad to talk right now!\n\n\
                     His name is ",
                ),
                Sex::Female => adj(
                    "I found [an opponent|a supporter] who would be glad to talk right now!\n\n\
                     Her name is ",
                ),
            };
            let outro = match other_sex {
                Sex::Male => ". I've introduced you to him as well - feel free to call!",
                Sex::Female => ". I've introduced you to her as well - feel free to call!",
            };
            let text = format!("{intro}{other_name}{outro}");
            Rendered {
                entities: vec![mention(&intro, other_name, *other_uid)],
                text,
                keyboard: Some(vec![vec![Cmd::ImAvailableNow]]),
                expects_reply: false,
            }
        }
        MessageKind::AreYouAvailable { other_sex } => {
            let text = match other_sex {
                Sex::Male => adj(
                    "[An opponent|A supporter] is free for a call right now. \
                     Are you free to talk with him now?",
                ),
                Sex::Female => adj(
                    "[An opponent|A supporter] is free for a call right now. \
                     Are you free to talk with her now?",
                ),
            };
            Rendered::with_keyboard(text, vec![vec![Cmd::AnswerAvailable, Cmd::AnswerUnavailable]])
        }
        MessageKind::AfterAskingTimedOut => Rendered::with_keyboard(
            adj("Sorry, the time to answer ran out.\n\n\
                 But press the button below and I'll gladly look for \
                 [another opponent|another supporter]!"),
            vec![vec![Cmd::ImAvailableNow]],
        ),
        MessageKind::AfterReplyUnavailable => Rendered::with_keyboard(
            "No problem. Press the button below whenever it suits you to talk!".to_string(),
            vec![vec![Cmd::ImAvailableNow]],
        ),
        MessageKind::SearchTimedOut => Rendered::with_keyboard(
            adj("I couldn't find an available [opponent|supporter] for now. But when \
                 [an opponent|a supporter] looks for someone to talk to, I'll ask \
                 whether you're free.\n\n\
                 You're welcome to press the button again whenever you like - it puts \
                 you at the front of the line."),
            vec![vec![Cmd::ImAvailableNow, Cmd::ImNoLongerAvailable]],
        ),
        MessageKind::AfterStopSearch => Rendered::with_keyboard(
            "I stopped the search. Whenever you want, press the button below.".to_string(),
            vec![vec![Cmd::ImAvailableNow]],
        ),
        MessageKind::HowWasTheCall => Rendered::with_keyboard(
            // Trailing no-break space widens the message so the five rating
            // buttons get room.
            "Once you have finished - how satisfied were you with the call?\n\u{00A0}".to_string(),
            vec![
                vec![Cmd::S1, Cmd::S2, Cmd::S3, Cmd::S4, Cmd::S5],
                vec![Cmd::SDidntTalk, Cmd::SNoAnswer],
            ],
        ),
        MessageKind::ThanksForAnswering { reply } => {
            let text = match reply {
                Cmd::S1 | Cmd::S2 => {
                    "\u{1F614} Sorry to hear! Maybe the next call will be better? \
                     Press the button to try again \u{1F4AA}"
                }
                Cmd::S3 => "Thanks for the feedback! Try again whenever you're comfortable.",
                Cmd::S4 | Cmd::S5 => "Wonderful! Press the button again whenever you like!",
                Cmd::SDidntTalk => {
                    "Good to know. Whenever you want to try another call, \
                     the button below is waiting."
                }
                _ => "That's fine. Press the button for another call whenever you like!",
            };
            Rendered::with_keyboard(text.to_string(), vec![vec![Cmd::ImAvailableNow]])
        }
    }
}
