//! PushId: chronologically ordered unique keys for new children.
//!
//! 8 characters of millisecond timestamp followed by 12 random characters,
//! both drawn from a 64-character alphabet whose ASCII order matches its
//! digit order, so ids sort lexicographically in generation order. Ids minted
//! within the same millisecond increment the random tail instead of
//! re-rolling it.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_LEN: usize = 8;
const RAND_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum PushIdError {
    #[error("Invalid push ID length: expected 20 chars, got {0}")]
    InvalidLength(usize),
    #[error("Invalid push ID character: {0:?}")]
    InvalidChar(char),
}

/// A generated child key.
///
/// # Examples
/// ```
/// use bind_core::PushIdGenerator;
///
/// let mut generator = PushIdGenerator::new();
/// let first = generator.next_id();
/// let second = generator.next_id();
/// assert!(first < second);
/// assert_eq!(first.as_str().len(), 20);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PushId(String);

impl PushId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Milliseconds since the Unix epoch encoded in the leading characters.
    pub fn timestamp_millis(&self) -> u64 {
        self.0.bytes().take(TIME_LEN).fold(0u64, |acc, b| {
            // Validated on construction.
            let digit = PUSH_CHARS.iter().position(|&c| c == b).unwrap_or(0) as u64;
            acc * 64 + digit
        })
    }
}

impl Display for PushId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PushId {
    type Err = PushIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TIME_LEN + RAND_LEN {
            return Err(PushIdError::InvalidLength(s.len()));
        }
        if let Some(bad) = s.chars().find(|c| !c.is_ascii() || !PUSH_CHARS.contains(&(*c as u8))) {
            return Err(PushIdError::InvalidChar(bad));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<PushId> for String {
    fn from(id: PushId) -> String {
        id.0
    }
}

/// Stateful generator; keep one per store so same-millisecond ids stay ordered.
#[derive(Debug, Default)]
pub struct PushIdGenerator {
    last_time: u64,
    last_rand: [u8; RAND_LEN],
}

impl PushIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> PushId {
        self.next_id_at(now_millis())
    }

    /// Generate an id as if the clock read `now` milliseconds.
    pub fn next_id_at(&mut self, now: u64) -> PushId {
        let duplicate = now == self.last_time;
        self.last_time = now;

        let mut out = [0u8; TIME_LEN + RAND_LEN];
        let mut time = now;
        for slot in out[..TIME_LEN].iter_mut().rev() {
            *slot = PUSH_CHARS[(time % 64) as usize];
            time /= 64;
        }

        if duplicate {
            self.increment_tail();
        } else {
            use rand::Rng;
            let mut rng = rand::rng();
            for digit in self.last_rand.iter_mut() {
                *digit = rng.random_range(0..64);
            }
        }

        for (slot, digit) in out[TIME_LEN..].iter_mut().zip(self.last_rand) {
            *slot = PUSH_CHARS[digit as usize];
        }

        PushId(out.iter().map(|&b| b as char).collect())
    }

    fn increment_tail(&mut self) {
        for digit in self.last_rand.iter_mut().rev() {
            if *digit == 63 {
                *digit = 0;
            } else {
                *digit += 1;
                return;
            }
        }
    }
}

fn now_millis() -> u64 {
    use web_time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_and_alphabet() {
        let id = PushIdGenerator::new().next_id();
        assert_eq!(id.as_str().len(), 20);
        assert!(id.as_str().bytes().all(|b| PUSH_CHARS.contains(&b)));
    }

    #[test]
    fn test_same_millisecond_is_strictly_increasing() {
        let mut generator = PushIdGenerator::new();
        let mut previous = generator.next_id_at(1_000);
        for _ in 0..500 {
            let next = generator.next_id_at(1_000);
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }

    #[test]
    fn test_later_timestamp_sorts_later() {
        let mut generator = PushIdGenerator::new();
        let early = generator.next_id_at(1_000);
        let late = generator.next_id_at(1_001);
        assert!(late > early);
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let mut generator = PushIdGenerator::new();
        let id = generator.next_id_at(1_412_345_678_901);
        assert_eq!(id.timestamp_millis(), 1_412_345_678_901);
    }

    #[test]
    fn test_tail_carries() {
        let mut generator = PushIdGenerator::new();
        generator.next_id_at(5);
        generator.last_rand = [63; RAND_LEN];
        generator.last_rand[0] = 1;
        let id = generator.next_id_at(5);
        assert_eq!(&id.as_str()[TIME_LEN..], "1-----------");
    }

    #[test]
    fn test_parse() {
        let id = PushIdGenerator::new().next_id();
        let parsed: PushId = id.as_str().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("short".parse::<PushId>().is_err());
        assert!("-JhLeOlGIEjaIOFHR0x!".parse::<PushId>().is_err());
    }
}
