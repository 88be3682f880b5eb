use std::collections::{HashMap, HashSet};

use chrono::{DateTime, TimeZone};

use crate::model::{Message, MessageId};

/// Index-level difference between two projections of the same conversation.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MessageDiff {
    /// Indices into the new list.
    pub inserted: Vec<usize>,
    /// Indices into the new list.
    pub updated: Vec<usize>,
    /// Indices into the old list.
    pub removed: Vec<usize>,
}

/// Messages are matched by id; a match counts as updated when its state or
/// content changed. Order is taken from the lists as given, never re-sorted.
pub(crate) fn diff_messages(old: &[Message], new: &[Message]) -> MessageDiff {
    let previous: HashMap<&MessageId, &Message> = old.iter().map(|m| (&m.id, m)).collect();
    let current: HashSet<&MessageId> = new.iter().map(|m| &m.id).collect();

    let mut diff = MessageDiff::default();
    for (index, message) in new.iter().enumerate() {
        match previous.get(&message.id) {
            None => diff.inserted.push(index),
            Some(before) if before.state != message.state || before.content != message.content => {
                diff.updated.push(index)
            }
            Some(_) => {}
        }
    }
    diff.removed = old
        .iter()
        .enumerate()
        .filter(|(_, m)| !current.contains(&m.id))
        .map(|(index, _)| index)
        .collect();
    diff
}

/// Bubble header text for a message timestamp relative to `now`.
pub(crate) fn format_timestamp<Tz: TimeZone>(at: &DateTime<Tz>, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let days = (now.date_naive() - at.date_naive()).num_days();
    match days {
        0 => at.format("%H:%M").to_string(),
        1 => at.format("Yesterday %H:%M").to_string(),
        2..=6 => at.format("%A %H:%M").to_string(),
        _ => at.format("%b %-d, %Y").to_string(),
    }
}
