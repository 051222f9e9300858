//! Time-ordered correlation IDs (UUID version 7 layout).
//!
//! Every request that passes verification is stamped with a fresh
//! `X-Correlation-ID`. The ID is a 128-bit value laid out as:
//!
//! ```text
//!  0                   1                   2                   3
//! |        unix_ts_ms (48)        |ver|  seq (12)  |var|  random (62)  |
//! ```
//!
//! `seq` is the sub-millisecond part of the clock reading (nanoseconds >> 8).
//! The generator remembers the last `(unix_ts_ms << 12) | seq` it issued and
//! never hands out a value that is not strictly greater, so IDs from one
//! generator sort in issue order even when many are requested in the same
//! millisecond or the wall clock steps backwards.
//!
//! One process-wide instance is available through
//! [`CorrelationIdGenerator::global`]; tests build their own with an injected
//! [`Clock`] and [`EntropySource`].

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, TryRngCore};
use uuid::{Uuid, Variant};

use crate::error::CorrelationError;

const SEQ_BITS: u32 = 12;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << 48) - 1;
const NANOS_PER_MILLI: u32 = 1_000_000;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of cryptographically secure random bytes.
pub trait EntropySource: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CorrelationError>;
}

/// Reads from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), CorrelationError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CorrelationError::EntropyUnavailable(e.to_string()))
    }
}

/// A generated correlation ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Parse a canonical string, accepting only version 7 / RFC 4122 variant IDs.
    pub fn parse(s: &str) -> Option<Self> {
        let uuid = Uuid::parse_str(s).ok()?;
        (uuid.get_version_num() == 7 && uuid.get_variant() == Variant::RFC4122)
            .then_some(Self(uuid))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Embedded Unix timestamp in milliseconds.
    pub fn timestamp_ms(&self) -> u64 {
        let b = self.0.as_bytes();
        u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]])
    }

    /// Embedded 12-bit sequence fragment.
    pub fn sequence(&self) -> u16 {
        let b = self.0.as_bytes();
        u16::from_be_bytes([b[6] & 0x0f, b[7]])
    }

    /// `(timestamp_ms << 12) | sequence`, the value the generator orders on.
    pub fn tick(&self) -> u64 {
        (self.timestamp_ms() << SEQ_BITS) | u64::from(self.sequence())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

/// Issues strictly ordered [`CorrelationId`]s.
pub struct CorrelationIdGenerator {
    clock: Box<dyn Clock>,
    entropy: Box<dyn EntropySource>,
    /// Last issued `(unix_ts_ms << 12) | seq`; zero before the first call.
    last: Mutex<u64>,
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new(SystemClock, OsEntropy)
    }
}

impl fmt::Debug for CorrelationIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationIdGenerator")
            .field("last", &*self.lock_last())
            .finish_non_exhaustive()
    }
}

impl CorrelationIdGenerator {
    pub fn new(clock: impl Clock + 'static, entropy: impl EntropySource + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            entropy: Box::new(entropy),
            last: Mutex::new(0),
        }
    }

    /// The shared process-wide generator.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<CorrelationIdGenerator>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::default())))
    }

    /// Generate the next ID.
    ///
    /// # Errors
    /// Returns [`CorrelationError::EntropyUnavailable`] if the random source
    /// fails. No ID is issued and the ordering state is left untouched.
    pub fn generate(&self) -> Result<CorrelationId, CorrelationError> {
        let mut bytes = [0u8; 16];
        self.entropy.fill(&mut bytes)?;

        let tick = self.next_tick();
        let millis = tick >> SEQ_BITS;
        let seq = tick & SEQ_MASK;

        bytes[..6].copy_from_slice(&millis.to_be_bytes()[2..]);
        bytes[6] = 0x70 | ((seq >> 8) as u8 & 0x0f);
        bytes[7] = seq as u8;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        Ok(CorrelationId(Uuid::from_bytes(bytes)))
    }

    /// Forget the last issued value.
    pub fn reset(&self) {
        *self.lock_last() = 0;
    }

    fn next_tick(&self) -> u64 {
        let now = self.clock.now();
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0) & TIMESTAMP_MASK;
        let seq = u64::from(now.timestamp_subsec_nanos() % NANOS_PER_MILLI) >> 8;
        let fresh = (millis << SEQ_BITS) | seq;

        let mut last = self.lock_last();
        let tick = if fresh > *last { fresh } else { *last + 1 };
        *last = tick;
        tick
    }

    fn lock_last(&self) -> MutexGuard<'_, u64> {
        // The guarded value is a plain integer; a panicking holder cannot leave it torn.
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn at(secs: i64, nanos: u32) -> Self {
            Self(Mutex::new(DateTime::from_timestamp(secs, nanos).unwrap()))
        }
    }

    impl Clock for Arc<FixedClock> {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    struct BrokenEntropy;

    impl EntropySource for BrokenEntropy {
        fn fill(&self, _buf: &mut [u8]) -> Result<(), CorrelationError> {
            Err(CorrelationError::EntropyUnavailable("getrandom failed".into()))
        }
    }

    fn fixed_generator(secs: i64, nanos: u32) -> (CorrelationIdGenerator, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::at(secs, nanos));
        (CorrelationIdGenerator::new(Arc::clone(&clock), OsEntropy), clock)
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    #[test]
    fn string_form_is_canonical_v7() {
        let id = CorrelationIdGenerator::default().generate().unwrap().to_string();

        assert_eq!(id.len(), 36);
        let groups: Vec<&str> = id.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(id.chars().all(|c| c == '-' || (c.is_ascii_hexdigit() && !c.is_ascii_uppercase())));
        assert_eq!(&id[14..15], "7", "version nibble: {id}");
        assert!(matches!(&id[19..20], "8" | "9" | "a" | "b"), "variant bits: {id}");
        assert!(CorrelationId::parse(&id).is_some());
    }

    #[test]
    fn timestamp_and_sequence_come_from_the_clock() {
        // 1_700_000_000.123_512_000 → ms = 1_700_000_000_123, sub-ms nanos = 512_000
        let (generator, _) = fixed_generator(1_700_000_000, 123_512_000);
        let id = generator.generate().unwrap();

        assert_eq!(id.timestamp_ms(), 1_700_000_000_123);
        assert_eq!(id.sequence(), (512_000u32 >> 8) as u16);
    }

    #[test]
    fn parse_rejects_other_versions() {
        let v4 = "9f1c2a4e-3b7d-4c1e-8a2b-1d2e3f4a5b6c";
        assert!(CorrelationId::parse(v4).is_none());
        assert!(CorrelationId::parse("not-a-uuid").is_none());
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[test]
    fn same_instant_yields_strictly_increasing_ticks() {
        let (generator, _) = fixed_generator(1_700_000_000, 0);
        let ticks: Vec<u64> = (0..100).map(|_| generator.generate().unwrap().tick()).collect();

        for pair in ticks.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn clock_stepping_backwards_does_not_reorder() {
        let (generator, clock) = fixed_generator(1_700_000_100, 0);
        let before = generator.generate().unwrap();

        *clock.0.lock().unwrap() = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let after = generator.generate().unwrap();

        assert!(after.tick() > before.tick());
        assert_eq!(after.timestamp_ms(), before.timestamp_ms());
    }

    #[test]
    fn sequence_overflow_carries_into_timestamp() {
        // 999_999 ns into the millisecond → seq 3906; push it to the 0xfff ceiling.
        let (generator, _) = fixed_generator(1_700_000_000, 999_999);
        let first = generator.generate().unwrap();
        for _ in 0..(0xfff - first.sequence() as u64) {
            generator.generate().unwrap();
        }
        let rolled = generator.generate().unwrap();

        assert_eq!(rolled.timestamp_ms(), first.timestamp_ms() + 1);
        assert_eq!(rolled.sequence(), 0);
    }

    #[test]
    fn reset_forgets_last_issued_value() {
        let (generator, _) = fixed_generator(1_700_000_000, 0);
        let a = generator.generate().unwrap();
        generator.generate().unwrap();

        generator.reset();
        let b = generator.generate().unwrap();
        assert_eq!(a.tick(), b.tick());
        assert_ne!(a, b, "random fill still differs");
    }

    #[test]
    fn concurrent_generation_is_unique_and_ordered_per_caller() {
        let generator = Arc::new(CorrelationIdGenerator::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| generator.generate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            for pair in ids.windows(2) {
                assert!(pair[1].tick() > pair[0].tick(), "per-caller order violated");
            }
            all.extend(ids);
        }

        assert_eq!(all.len(), 2000);
        let strings: HashSet<String> = all.iter().map(ToString::to_string).collect();
        assert_eq!(strings.len(), 2000);

        let mut ticks: Vec<u64> = all.iter().map(CorrelationId::tick).collect();
        ticks.sort_unstable();
        ticks.dedup();
        assert_eq!(ticks.len(), 2000, "two calls shared a (timestamp, sequence) pair");
    }

    #[test]
    fn global_instance_is_shared() {
        let a = CorrelationIdGenerator::global();
        let b = CorrelationIdGenerator::global();
        assert!(Arc::ptr_eq(&a, &b));

        let first = a.generate().unwrap();
        let second = b.generate().unwrap();
        assert!(second.tick() > first.tick());
    }

    // -----------------------------------------------------------------------
    // Failure
    // -----------------------------------------------------------------------

    #[test]
    fn entropy_failure_is_an_error_not_an_empty_id() {
        let generator = CorrelationIdGenerator::new(SystemClock, BrokenEntropy);
        let err = generator.generate().unwrap_err();
        assert!(err.to_string().contains("getrandom failed"));
        assert_eq!(*generator.lock_last(), 0, "no tick consumed on failure");
    }
}
