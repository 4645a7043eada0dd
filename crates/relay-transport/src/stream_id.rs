use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TransportError;

/// Position of an entry in a stream: `<millis>-<seq>`.
///
/// Ids are unique within a stream and strictly increasing in append order,
/// even when the wall clock stalls or steps backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl StreamId {
    /// Sorts before every real entry; reading after it yields the whole stream.
    pub const ZERO: StreamId = StreamId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id greater than `self` for a clock reading of `now_millis`.
    pub fn next_after(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((m, q)) => (m, q),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for StreamId {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: StreamId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, StreamId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("0".parse::<StreamId>().unwrap(), StreamId::ZERO);
        assert!("abc-1".parse::<StreamId>().is_err());
        assert!("12-".parse::<StreamId>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(StreamId::new(5, 0) > StreamId::new(4, 99));
        assert!(StreamId::new(5, 1) > StreamId::new(5, 0));
        assert!(StreamId::ZERO < StreamId::new(0, 1));
    }

    #[test]
    fn test_next_after_is_monotonic_under_clock_skew() {
        let last = StreamId::new(100, 4);
        assert_eq!(last.next_after(150), StreamId::new(150, 0));
        assert_eq!(last.next_after(100), StreamId::new(100, 5));
        assert_eq!(last.next_after(90), StreamId::new(100, 5));
    }
}
