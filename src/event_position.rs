//! Starting positions for consumer links.

use time::OffsetDateTime;

const OFFSET_ANNOTATION: &str = "amqp.annotation.x-opt-offset";
const SEQUENCE_NUMBER_ANNOTATION: &str = "amqp.annotation.x-opt-sequence-number";
const ENQUEUED_TIME_ANNOTATION: &str = "amqp.annotation.x-opt-enqueued-time";

/// Offset addressing the first event available in a partition.
const START_OF_STREAM_OFFSET: &str = "-1";
/// Offset addressing the point immediately after the last enqueued event.
const END_OF_STREAM_OFFSET: &str = "@latest";

/// Position in a partition's event stream from which a consumer link starts
/// reading. Translated into a selector filter on the link source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPosition {
    /// The first event available in the partition.
    Earliest,
    /// Only events enqueued after the link is attached.
    Latest,
    /// An event identified by its offset within the partition.
    Offset {
        /// The service-issued offset value.
        offset: String,
        /// Whether the event at the offset itself is included.
        inclusive: bool,
    },
    /// An event identified by its sequence number within the partition.
    SequenceNumber {
        /// The service-issued sequence number.
        sequence_number: i64,
        /// Whether the event with that sequence number is included.
        inclusive: bool,
    },
    /// The first event enqueued at or after the given instant.
    EnqueuedTime(OffsetDateTime),
}

impl EventPosition {
    /// Position at the start of the partition.
    pub fn earliest() -> Self {
        Self::Earliest
    }

    /// Position after the last event currently enqueued.
    pub fn latest() -> Self {
        Self::Latest
    }

    /// Position at the given offset.
    pub fn from_offset(offset: impl Into<String>, inclusive: bool) -> Self {
        Self::Offset {
            offset: offset.into(),
            inclusive,
        }
    }

    /// Position at the given sequence number.
    pub fn from_sequence_number(sequence_number: i64, inclusive: bool) -> Self {
        Self::SequenceNumber {
            sequence_number,
            inclusive,
        }
    }

    /// Position at the given enqueued time.
    pub fn from_enqueued_time(enqueued_time: OffsetDateTime) -> Self {
        Self::EnqueuedTime(enqueued_time)
    }

    /// Renders the position as a selector expression over the partition
    /// annotations the service stamps on every event.
    pub(crate) fn filter_expression(&self) -> String {
        match self {
            Self::Earliest => {
                format!("{OFFSET_ANNOTATION} > '{START_OF_STREAM_OFFSET}'")
            }
            Self::Latest => {
                format!("{OFFSET_ANNOTATION} > '{END_OF_STREAM_OFFSET}'")
            }
            Self::Offset { offset, inclusive } => {
                format!("{OFFSET_ANNOTATION} {} '{offset}'", comparison(*inclusive))
            }
            Self::SequenceNumber {
                sequence_number,
                inclusive,
            } => {
                format!(
                    "{SEQUENCE_NUMBER_ANNOTATION} {} {sequence_number}",
                    comparison(*inclusive)
                )
            }
            Self::EnqueuedTime(enqueued_time) => {
                let millis = enqueued_time.unix_timestamp_nanos() / 1_000_000;
                format!("{ENQUEUED_TIME_ANNOTATION} > {millis}")
            }
        }
    }
}

fn comparison(inclusive: bool) -> &'static str {
    if inclusive {
        ">="
    } else {
        ">"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_filters_from_the_start_of_the_stream() {
        assert_eq!(
            EventPosition::earliest().filter_expression(),
            "amqp.annotation.x-opt-offset > '-1'"
        );
    }

    #[test]
    fn latest_filters_from_the_end_of_the_stream() {
        assert_eq!(
            EventPosition::latest().filter_expression(),
            "amqp.annotation.x-opt-offset > '@latest'"
        );
    }

    #[test]
    fn offset_positions_respect_inclusivity() {
        assert_eq!(
            EventPosition::from_offset("12345", false).filter_expression(),
            "amqp.annotation.x-opt-offset > '12345'"
        );
        assert_eq!(
            EventPosition::from_offset("12345", true).filter_expression(),
            "amqp.annotation.x-opt-offset >= '12345'"
        );
    }

    #[test]
    fn sequence_number_positions_are_unquoted() {
        assert_eq!(
            EventPosition::from_sequence_number(662, false).filter_expression(),
            "amqp.annotation.x-opt-sequence-number > 662"
        );
        assert_eq!(
            EventPosition::from_sequence_number(662, true).filter_expression(),
            "amqp.annotation.x-opt-sequence-number >= 662"
        );
    }

    #[test]
    fn enqueued_time_positions_use_unix_milliseconds() {
        let position =
            EventPosition::from_enqueued_time(OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap());
        assert_eq!(
            position.filter_expression(),
            "amqp.annotation.x-opt-enqueued-time > 1600000000000"
        );
    }
}
