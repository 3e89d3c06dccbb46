/*!
 * @file objectid.rs
 * @brief ObjectId generation: timestamp(4) | processRandom(5) | counter(3)
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bson::oid::ObjectId;
use rand::Rng;

/// Per spec §9 REDESIGN FLAGS: an explicit generator value constructed once at
/// startup, rather than ambient process-global statics. `processRandom` is
/// fixed for the generator's lifetime; `counter` is a single atomic that
/// wraps at 2^24, seeded from a uniform random value.
pub struct ObjectIdGenerator {
    process_random: [u8; 5],
    counter: AtomicU32,
}

impl ObjectIdGenerator {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut process_random = [0u8; 5];
        rng.fill(&mut process_random);
        Self {
            process_random,
            counter: AtomicU32::new(rng.gen_range(0..0x0100_0000)),
        }
    }

    /// Produce the next ObjectId. Strictly monotonic by counter for calls
    /// made within the same process-second (spec §3, §8).
    pub fn next(&self) -> ObjectId {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;

        let counter = self.counter.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());
        bytes[4..9].copy_from_slice(&self.process_random);
        bytes[9] = ((counter >> 16) & 0xFF) as u8;
        bytes[10] = ((counter >> 8) & 0xFF) as u8;
        bytes[11] = (counter & 0xFF) as u8;

        ObjectId::from_bytes(bytes)
    }
}

impl Default for ObjectIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_monotonic_within_one_process_second() {
        let gen = ObjectIdGenerator::new();
        let ids: Vec<ObjectId> = (0..1000).map(|_| gen.next()).collect();
        for window in ids.windows(2) {
            let a = window[0].bytes();
            let b = window[1].bytes();
            // same timestamp+processRandom prefix in this tight loop
            if a[0..9] == b[0..9] {
                let counter_a = u32::from_be_bytes([0, a[9], a[10], a[11]]);
                let counter_b = u32::from_be_bytes([0, b[9], b[10], b[11]]);
                assert!(counter_b > counter_a || (counter_a == 0x00FF_FFFF && counter_b == 0));
            }
        }
    }

    #[test]
    fn round_trips_through_hex_string() {
        let gen = ObjectIdGenerator::new();
        let id = gen.next();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 24);
        let parsed = ObjectId::parse_str(&hex).unwrap();
        assert_eq!(parsed, id);
    }
}
