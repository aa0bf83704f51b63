#![allow(dead_code)]

use shoal::{Record, Source};

/// Yields keys `begin..end` as little-endian u64 bytes; the value for key
/// `i` is the byte `L = (i + delta) % 256` repeated `L` times.
pub struct VariedSource {
    begin: u64,
    end: u64,
    delta: u64,
    at: u64,
    key: [u8; 8],
    val: Vec<u8>,
}

impl VariedSource {
    pub fn new(begin: u64, end: u64, delta: u64) -> Self {
        Self {
            begin,
            end,
            delta,
            at: begin,
            key: [0; 8],
            val: Vec::new(),
        }
    }
}

impl Source for VariedSource {
    fn reset(&mut self) {
        self.at = self.begin;
    }

    fn total(&self) -> usize {
        (self.end - self.begin) as usize
    }

    fn read(&mut self) -> Record<'_> {
        let i = self.at;
        self.at += 1;
        self.key = i.to_le_bytes();
        self.val = value_of(i, self.delta);
        Record {
            key: &self.key,
            val: &self.val,
        }
    }
}

pub fn key_of(i: u64) -> [u8; 8] {
    i.to_le_bytes()
}

pub fn value_of(i: u64, delta: u64) -> Vec<u8> {
    let len = ((i + delta) % 256) as usize;
    vec![len as u8; len]
}
