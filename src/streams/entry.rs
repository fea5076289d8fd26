//! Stream entries and their wire fields
//!
//! Every entry is a flat map of string fields. The engine relies on four of
//! them; dead-letter copies add provenance fields on top.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const FIELD_TYPE: &str = "type";
pub const FIELD_EVENT_ID: &str = "eventId";
pub const FIELD_OCCURRED_AT: &str = "occurredAt";
pub const FIELD_PAYLOAD: &str = "payload";

pub const FIELD_SOURCE_CHANNEL: &str = "sourceChannel";
pub const FIELD_SOURCE_GROUP: &str = "sourceGroup";
pub const FIELD_SOURCE_ID: &str = "sourceId";
pub const FIELD_DELIVERY_COUNT: &str = "deliveryCount";

pub type FieldMap = BTreeMap<String, String>;

/// Broker-assigned entry id, `<millis>-<sequence>`
///
/// Ordering follows append order within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// The id that would follow `self` if appended at `now_millis`
    pub fn next_after(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid entry id '{0}'")]
pub struct ParseEntryIdError(String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_string());
        let (millis, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry read from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: FieldMap,
}

impl StreamEntry {
    pub fn new(id: EntryId, fields: FieldMap) -> Self {
        Self { id, fields }
    }

    /// Field value, or `None` when absent or blank
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn event_type(&self) -> Option<&str> {
        self.field(FIELD_TYPE)
    }

    pub fn payload(&self) -> Option<&str> {
        self.field(FIELD_PAYLOAD)
    }

    pub fn event_id(&self) -> Option<&str> {
        self.field(FIELD_EVENT_ID)
    }

    /// `(type, payload)` when both are present and non-blank
    pub fn routable(&self) -> Option<(&str, &str)> {
        Some((self.event_type()?, self.payload()?))
    }

    /// Field map for the dead-letter copy of this entry
    ///
    /// Carries the routing fields and dedup token alongside provenance so an
    /// operator can replay it to the source channel.
    pub fn dead_letter_fields(
        &self,
        source_channel: &str,
        source_group: &str,
        delivery_count: u64,
    ) -> FieldMap {
        let mut fields: FieldMap = [FIELD_TYPE, FIELD_PAYLOAD, FIELD_EVENT_ID, FIELD_OCCURRED_AT]
            .into_iter()
            .filter_map(|name| {
                self.fields
                    .get(name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect();
        fields.insert(FIELD_SOURCE_CHANNEL.to_string(), source_channel.to_string());
        fields.insert(FIELD_SOURCE_GROUP.to_string(), source_group.to_string());
        fields.insert(FIELD_SOURCE_ID.to_string(), self.id.to_string());
        fields.insert(FIELD_DELIVERY_COUNT.to_string(), delivery_count.to_string());
        fields
    }
}

/// An entry delivered to a consumer and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub delivery_count: u64,
    pub idle: Duration,
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Replay everything already in the channel
    Beginning,
    /// Only entries appended after the group is created
    Tail,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: &[(&str, &str)]) -> StreamEntry {
        StreamEntry::new(
            EntryId::new(1700000000000, 3),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_entry_id_display_and_parse() {
        let id = EntryId::new(1700000000000, 3);
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("1700000000000-3".parse::<EntryId>().unwrap(), id);
        assert!("garbage".parse::<EntryId>().is_err());
        assert!("12-x".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_ordering_and_next() {
        let id = EntryId::new(10, 0);
        assert_eq!(id.next_after(10), EntryId::new(10, 1));
        assert_eq!(id.next_after(5), EntryId::new(10, 1));
        assert_eq!(id.next_after(11), EntryId::new(11, 0));
        assert!(EntryId::new(10, 9) < EntryId::new(11, 0));
    }

    #[test]
    fn test_routable_requires_type_and_payload() {
        assert_eq!(
            entry(&[("type", "post.created"), ("payload", "{}")]).routable(),
            Some(("post.created", "{}"))
        );
        assert_eq!(entry(&[("payload", "{}")]).routable(), None);
        assert_eq!(entry(&[("type", "post.created"), ("payload", "  ")]).routable(), None);
    }

    #[test]
    fn test_dead_letter_fields_carry_provenance() {
        let original = entry(&[
            ("type", "post.created"),
            ("payload", "{\"id\":1}"),
            ("eventId", "e-1"),
            ("occurredAt", "2025-07-27T10:00:00.000Z"),
            ("unrelated", "x"),
        ]);
        let fields = original.dead_letter_fields("posts", "feed", 4);

        assert_eq!(fields[FIELD_TYPE], "post.created");
        assert_eq!(fields[FIELD_PAYLOAD], "{\"id\":1}");
        assert_eq!(fields[FIELD_EVENT_ID], "e-1");
        assert_eq!(fields[FIELD_SOURCE_CHANNEL], "posts");
        assert_eq!(fields[FIELD_SOURCE_GROUP], "feed");
        assert_eq!(fields[FIELD_SOURCE_ID], "1700000000000-3");
        assert_eq!(fields[FIELD_DELIVERY_COUNT], "4");
        assert!(!fields.contains_key("unrelated"));
    }
}
