//! Timestamp identifiers.
//!
//! A TID packs `microseconds-since-epoch << 10 | clock_id` into 64 bits (top
//! bit clear) and renders it as 13 characters of the sort-order-preserving
//! base-32 alphabet. Lexicographic order on the string equals numeric order
//! on the packed value, which is what makes TIDs usable as record keys.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use rand::Rng;

/// The sortable base-32 alphabet.
const S32_CHAR: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Mask keeping the top bit clear and the low 10 bits for the clock id.
const TIMESTAMP_MASK: u64 = 0x7fff_ffff_ffff_fc00;

/// One microsecond, in packed-value units.
const ONE_MICRO: u64 = 1 << 10;

/// TID parse failures.
#[derive(Debug, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum TidError {
    /// TIDs are exactly 13 characters.
    #[error("tid must be 13 characters, got {0}")]
    BadLength(usize),

    /// Character outside the sortable base-32 alphabet.
    #[error("invalid tid character {0:?}")]
    BadChar(char),

    /// First character would set the top bit.
    #[error("tid out of range")]
    OutOfRange,
}

/// A 13-character sortable timestamp identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(u64);

impl Tid {
    /// Packs a timestamp and clock id. The timestamp is masked to 53 bits
    /// (top bit stays clear), the clock id to 10.
    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        Tid((micros << 10) & TIMESTAMP_MASK | (clock_id as u64 & 0x3ff))
    }

    /// The raw packed value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Microseconds since the epoch. Exact for well-formed TIDs.
    pub fn timestamp_micros(&self) -> u64 {
        self.0 >> 10
    }

    /// The 10-bit clock id.
    pub fn clock_id(&self) -> u16 {
        (self.0 & 0x3ff) as u16
    }

    /// Parses the 13-character form.
    pub fn parse(s: &str) -> Result<Self, TidError> {
        if s.len() != 13 {
            return Err(TidError::BadLength(s.len()));
        }
        let mut value: u64 = 0;
        for c in s.chars() {
            let digit = s32_digit(c).ok_or(TidError::BadChar(c))?;
            value = value << 5 | digit as u64;
        }
        // 13 * 5 = 65 bits; the shift above drops the 65th, so re-check the
        // first character directly: it must leave the top bit clear.
        let first = s32_digit(s.chars().next().expect("len 13")).expect("checked");
        if first >= 16 {
            return Err(TidError::OutOfRange);
        }
        Ok(Tid(value))
    }
}

fn s32_digit(c: char) -> Option<u8> {
    S32_CHAR.iter().position(|&b| b as char == c).map(|i| i as u8)
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; 13];
        let mut v = self.0;
        for slot in out.iter_mut().rev() {
            *slot = S32_CHAR[(v & 0x1f) as usize];
            v >>= 5;
        }
        // Safety of from_utf8: every byte comes from the ASCII alphabet.
        f.write_str(std::str::from_utf8(&out).expect("ascii"))
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({self})")
    }
}

impl FromStr for Tid {
    type Err = TidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for Tid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Tid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = serde::Deserialize::deserialize(deserializer)?;
        Tid::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Issues strictly increasing TIDs for one process.
///
/// The clock id is drawn uniformly at random once and kept for the ticker's
/// lifetime. When the wall clock regresses (or two calls land in the same
/// microsecond) the previous value is advanced by one microsecond instead.
#[derive(Debug)]
pub struct Ticker {
    clock_id: u16,
    last: Mutex<u64>,
}

impl Ticker {
    /// Creates a ticker with a random clock id.
    pub fn new() -> Self {
        Self::with_clock_id(rand::thread_rng().gen_range(0..1024))
    }

    /// Creates a ticker with a fixed clock id (useful in tests).
    pub fn with_clock_id(clock_id: u16) -> Self {
        Ticker {
            clock_id: clock_id & 0x3ff,
            last: Mutex::new(0),
        }
    }

    /// The clock id this ticker stamps into every TID.
    pub fn clock_id(&self) -> u16 {
        self.clock_id
    }

    /// Raises the ticker's floor so every future TID is strictly greater
    /// than `tid`. Used after reload to keep revs monotonic across restarts.
    pub fn observe_floor(&self, tid: Tid) {
        let mut last = self.last.lock().expect("ticker lock");
        *last = (*last).max(tid.as_u64());
    }

    /// Returns a TID strictly greater than every TID this ticker has issued.
    pub fn next(&self) -> Tid {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let candidate = Tid::from_parts(now, self.clock_id).as_u64();
        let mut last = self.last.lock().expect("ticker lock");
        let value = if candidate > *last {
            candidate
        } else {
            *last + ONE_MICRO
        };
        *last = value;
        Tid(value)
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}
