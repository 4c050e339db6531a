use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Event payloads and action arguments are JSON objects
pub type Payload = serde_json::Map<String, serde_json::Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Name of a flow definition
    FlowId
);
string_id!(
    /// Identity of an event, unique within a processing step
    EventId
);
string_id!(
    /// Identity of a running flow instance
    InstanceId
);
string_id!(
    /// Correlation token of one action invocation
    InvocationId
);
string_id!(
    /// Identity of an engine-owned timer
    TimerId
);

/// Identity of a head within its flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeadId(pub u32);

impl fmt::Display for HeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

fn splitmix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Source of v4-format identifiers.
///
/// The generator is plain data: it is part of the engine snapshot, so a
/// restored engine continues the exact id sequence it would have produced
/// without the round trip. Seeding it makes whole runs reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdGenerator {
    seed: u64,
    counter: u64,
}

impl IdGenerator {
    /// Create a generator with a fixed seed
    pub fn seeded(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    /// Create a generator with a random seed
    pub fn random() -> Self {
        Self::seeded(rand::thread_rng().gen())
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.counter
    }

    /// Produce the next uuid in the sequence
    pub fn next_uuid(&mut self) -> Uuid {
        self.counter += 1;
        // `seed + n * gamma` is injective in n and splitmix64 is a bijection,
        // so the high half never repeats for one seed.
        let hi = splitmix64(self.seed.wrapping_add(self.counter.wrapping_mul(GOLDEN_GAMMA)));
        let lo = splitmix64(hi ^ self.seed);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    /// Next event id
    pub fn event_id(&mut self) -> EventId {
        EventId(self.next_uuid().to_string())
    }

    /// Next flow instance id
    pub fn instance_id(&mut self) -> InstanceId {
        InstanceId(self.next_uuid().to_string())
    }

    /// Next action invocation id
    pub fn invocation_id(&mut self) -> InvocationId {
        InvocationId(self.next_uuid().to_string())
    }

    /// Next timer id
    pub fn timer_id(&mut self) -> TimerId {
        TimerId(self.next_uuid().to_string())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::random()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_seeded_generators_agree() {
        let mut a = IdGenerator::seeded(7);
        let mut b = IdGenerator::seeded(7);

        for _ in 0..32 {
            assert_eq!(a.next_uuid(), b.next_uuid());
        }
        assert_eq!(a.issued(), 32);
    }

    #[test]
    fn test_ids_are_unique_and_v4() {
        let mut ids = IdGenerator::seeded(42);
        let mut seen = HashSet::new();

        for _ in 0..10_000 {
            let id = ids.next_uuid();
            assert_eq!(id.get_version_num(), 4);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_generator_survives_serde_round_trip() {
        let mut ids = IdGenerator::seeded(3);
        ids.next_uuid();

        let json = serde_json::to_string(&ids).unwrap();
        let mut restored: IdGenerator = serde_json::from_str(&json).unwrap();

        assert_eq!(ids.next_uuid(), restored.next_uuid());
    }

    #[test]
    fn test_id_display() {
        assert_eq!(FlowId::from("greeting").to_string(), "greeting");
        assert_eq!(HeadId(3).to_string(), "h3");
    }
}
