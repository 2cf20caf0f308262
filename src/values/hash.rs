//! Platform-stable structural hashing.
//!
//! Fold assignment is a pure function of the group value's hash, and the
//! same dataset must partition identically on every machine. The std
//! hasher is randomly keyed per process, so values hash through a fixed
//! FNV-1a variant over a variant-tagged byte encoding instead.

use super::{Handle, Value};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Clone, Copy)]
struct Fnv64(u64);

impl Fnv64 {
    fn new() -> Self {
        Self(FNV_OFFSET)
    }

    fn write_u8(&mut self, byte: u8) {
        self.0 ^= u64::from(byte);
        self.0 = self.0.wrapping_mul(FNV_PRIME);
    }

    fn write_u64(&mut self, word: u64) {
        for byte in word.to_le_bytes() {
            self.write_u8(byte);
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_u8(byte);
        }
    }
}

/// Computes the stable structural hash of a value.
///
/// Identical values yield identical hashes across processes, platforms,
/// and releases; the encoding is part of the crate contract because the
/// cross-trainer's fold function consumes it.
pub fn stable_hash(value: &Value) -> u64 {
    let mut hasher = Fnv64::new();
    write_value(&mut hasher, value);
    hasher.0
}

fn write_value(hasher: &mut Fnv64, value: &Value) {
    match value {
        Value::Absent => hasher.write_u8(0),
        Value::Bool(v) => {
            hasher.write_u8(1);
            hasher.write_u8(u8::from(*v));
        }
        Value::Int(v) => {
            hasher.write_u8(2);
            hasher.write_u64(*v as u64);
        }
        Value::Float(v) => {
            hasher.write_u8(3);
            hasher.write_u64(v.to_bits());
        }
        Value::Str(s) => {
            hasher.write_u8(4);
            hasher.write_u64(s.len() as u64);
            hasher.write_bytes(s.as_bytes());
        }
        Value::List(items) => {
            hasher.write_u8(5);
            hasher.write_u64(items.len() as u64);
            for item in items.iter() {
                write_value(hasher, item);
            }
        }
        Value::Map(entries) => {
            hasher.write_u8(6);
            hasher.write_u64(entries.len() as u64);
            for (k, v) in entries.iter() {
                write_value(hasher, k);
                write_value(hasher, v);
            }
        }
        Value::Handle(h) => {
            hasher.write_u8(7);
            hasher.write_u64(handle_token(h));
        }
    }
}

// Handles have no structural content; their process-local address is the
// only identity available. Stable across a process, not across processes,
// which matches their contract (they never act as group keys on disk).
fn handle_token(h: &Handle) -> u64 {
    h.addr() as u64
}
