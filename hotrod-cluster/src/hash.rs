//! MurmurHash3 as used by Hot Rod servers for segment assignment
//!
//! This is the 64-bit variant with per-block evolving constants, seeded with
//! 9001. Tail bytes are sign-extended before mixing, matching the server
//! implementation so that client and server agree on every segment.

const SEED: u64 = 9001;

struct State {
    h1: u64,
    h2: u64,
    k1: u64,
    k2: u64,
    c1: u64,
    c2: u64,
}

impl State {
    fn bmix(&mut self) {
        self.k1 = self.k1.wrapping_mul(self.c1);
        self.k1 = self.k1.rotate_left(23);
        self.k1 = self.k1.wrapping_mul(self.c2);
        self.h1 ^= self.k1;
        self.h1 = self.h1.wrapping_add(self.h2);

        self.h2 = self.h2.rotate_left(41);

        self.k2 = self.k2.wrapping_mul(self.c2);
        self.k2 = self.k2.rotate_left(23);
        self.k2 = self.k2.wrapping_mul(self.c1);
        self.h2 ^= self.k2;
        self.h2 = self.h2.wrapping_add(self.h1);

        self.h1 = self.h1.wrapping_mul(3).wrapping_add(0x52dc_e729);
        self.h2 = self.h2.wrapping_mul(3).wrapping_add(0x3849_5ab5);

        self.c1 = self.c1.wrapping_mul(5).wrapping_add(0x7b7d_159c);
        self.c2 = self.c2.wrapping_mul(5).wrapping_add(0x6bce_6396);
    }
}

fn fmix(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

fn block(key: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Sign-extended byte, as a signed byte widened to 64 bits
fn widen(b: u8) -> u64 {
    b as i8 as i64 as u64
}

pub fn murmur3_x64_64(key: &[u8]) -> u64 {
    let mut state = State {
        h1: 0x9368_e53c_2f6a_f274 ^ SEED,
        h2: 0x586d_cd20_8f7c_d3fd ^ SEED,
        k1: 0,
        k2: 0,
        c1: 0x87c3_7b91_1142_53d5,
        c2: 0x4cf5_ad43_2745_937f,
    };

    let blocks = key.len() / 16;
    for i in 0..blocks {
        state.k1 = block(key, i * 16);
        state.k2 = block(key, i * 16 + 8);
        state.bmix();
    }

    state.k1 = 0;
    state.k2 = 0;
    let tail = &key[blocks * 16..];
    if !tail.is_empty() {
        for (i, b) in tail.iter().enumerate().skip(8) {
            state.k2 ^= widen(*b) << ((i - 8) * 8);
        }
        for (i, b) in tail.iter().enumerate().take(8) {
            state.k1 ^= widen(*b) << (i * 8);
        }
        state.bmix();
    }

    state.h2 ^= key.len() as u64;
    state.h1 = state.h1.wrapping_add(state.h2);
    state.h2 = state.h2.wrapping_add(state.h1);
    state.h1 = fmix(state.h1);
    state.h2 = fmix(state.h2);
    state.h1 = state.h1.wrapping_add(state.h2);
    state.h1
}

/// 32-bit key hash: the upper half of the 64-bit result
pub fn murmur3_hash(key: &[u8]) -> i32 {
    (murmur3_x64_64(key) >> 32) as i32
}

/// Width of one segment in the positive 31-bit hash space
pub fn segment_size(segment_count: u32) -> u32 {
    let count = segment_count.max(1) as u64;
    (((1u64 << 31) + count - 1) / count) as u32
}

/// Segment owning `key` for a segment map with `segment_count` segments
pub fn segment_of(key: &[u8], segment_count: u32) -> u32 {
    let normalized = (murmur3_hash(key) & i32::MAX) as u32;
    normalized / segment_size(segment_count)
}
