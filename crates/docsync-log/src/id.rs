//! Log entry identifiers.
//!
//! Ids have the form `<millis>-<seq>` and order by time first, then by
//! sequence within the same millisecond.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LogError;

/// Broker-assigned, monotonically increasing entry id.
///
/// The default id is [`MessageId::ZERO`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageId {
    pub millis: u64,
    pub seq: u64,
}

impl MessageId {
    /// The id that sorts before every real entry.
    pub const ZERO: MessageId = MessageId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Next id strictly after `self`, using `now_millis` when it has advanced.
    pub fn next_after(&self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0)
        } else {
            Self::new(self.millis, self.seq + 1)
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LogError::InvalidId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self::new(
            millis.parse().map_err(|_| invalid())?,
            seq.parse().map_err(|_| invalid())?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id = MessageId::new(1706540400000, 3);
        assert_eq!(id.to_string(), "1706540400000-3");
        assert_eq!("1706540400000-3".parse::<MessageId>().unwrap(), id);
        assert_eq!("42".parse::<MessageId>().unwrap(), MessageId::new(42, 0));
        assert!("abc-1".parse::<MessageId>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(MessageId::new(1, 5) < MessageId::new(2, 0));
        assert!(MessageId::new(2, 0) < MessageId::new(2, 1));
        assert!(MessageId::ZERO < MessageId::new(0, 1));
    }

    #[test]
    fn test_default_is_zero() {
        assert_eq!(MessageId::default(), MessageId::ZERO);
        assert!(MessageId::default().next_after(0) > MessageId::ZERO);
    }

    #[test]
    fn test_next_after_is_monotonic() {
        let id = MessageId::new(100, 0);
        assert_eq!(id.next_after(100), MessageId::new(100, 1));
        assert_eq!(id.next_after(50), MessageId::new(100, 1));
        assert_eq!(id.next_after(101), MessageId::new(101, 0));
    }
}
