//! Process-wide 128-bit identities.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Opaque 128-bit identity used to address services, messaging agents and
/// message types.
///
/// The canonical literal form is four dash-separated groups of eight hex
/// digits: `"1fc82db5-ea75f28a-c21c223b-10663645"`. [`Uid::parse`] accepts
/// it in const context, so identities can be `const` items.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid {
    pub v0: u64,
    pub v1: u64,
}

impl Uid {
    pub const NIL: Uid = Uid { v0: 0, v1: 0 };

    pub const fn new(v0: u64, v1: u64) -> Self {
        Self { v0, v1 }
    }

    /// Parses the canonical literal form; panics at compile time on a
    /// malformed literal when used in const context.
    pub const fn parse(literal: &str) -> Self {
        let bytes = literal.as_bytes();
        if bytes.len() != 35 {
            panic!("malformed UID literal: wrong length");
        }

        let mut groups = [0u64; 4];
        let mut group = 0;
        let mut pos = 0;

        while group < 4 {
            let mut value = 0u64;
            let mut digit = 0;
            while digit < 8 {
                let b = bytes[pos];
                let nibble = match b {
                    b'0'..=b'9' => (b - b'0') as u64,
                    b'a'..=b'f' => (b - b'a' + 10) as u64,
                    b'A'..=b'F' => (b - b'A' + 10) as u64,
                    _ => panic!("malformed UID literal: bad hex digit"),
                };
                value = (value << 4) | nibble;
                pos += 1;
                digit += 1;
            }
            groups[group] = value;
            group += 1;

            if group < 4 {
                if bytes[pos] != b'-' {
                    panic!("malformed UID literal: missing separator");
                }
                pos += 1;
            }
        }

        Self {
            v0: (groups[0] << 32) | groups[1],
            v1: (groups[2] << 32) | groups[3],
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:08x}-{:08x}-{:08x}",
            self.v0 >> 32,
            self.v0 & 0xFFFF_FFFF,
            self.v1 >> 32,
            self.v1 & 0xFFFF_FFFF
        )
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({self})")
    }
}

static UID_NAMES: Lazy<RwLock<HashMap<Uid, String>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Debug-only table of human-readable UID names used in log messages.
///
/// Purely diagnostic, never consulted by routing or lookup logic.
pub struct UidRegistry;

impl UidRegistry {
    pub fn register(uid: Uid, name: &str) {
        UID_NAMES.write().insert(uid, name.to_owned());
    }

    pub fn unregister(uid: Uid) {
        UID_NAMES.write().remove(&uid);
    }

    /// Returns the registered name, or the literal form if none is known
    pub fn lookup(uid: Uid) -> String {
        if let Some(name) = UID_NAMES.read().get(&uid) {
            return format!("{name} ({uid})");
        }
        uid.to_string()
    }
}
