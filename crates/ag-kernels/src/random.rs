//! Counter-based uniform sampling for `rand_like`.
//!
//! Uses the ThreeFry2x32 block cipher (Salmon et al., SC'11): element `i` of
//! the output is the cipher applied to counter `i` under a key derived from
//! the seed, so results are independent of evaluation order.

use ag_core::TensorValue;

use crate::EvalError;

const ROTATIONS: [u32; 8] = [13, 15, 26, 6, 17, 29, 16, 24];
const NUM_ROUNDS: usize = 20;
const KS_PARITY: u32 = 0x1BD1_1BDA;

#[must_use]
pub fn threefry2x32(key: [u32; 2], counter: [u32; 2]) -> [u32; 2] {
    let schedule = [key[0], key[1], key[0] ^ key[1] ^ KS_PARITY];
    let mut x0 = counter[0].wrapping_add(key[0]);
    let mut x1 = counter[1].wrapping_add(key[1]);

    for round in 0..NUM_ROUNDS {
        x0 = x0.wrapping_add(x1);
        x1 = x1.rotate_left(ROTATIONS[round % 8]) ^ x0;
        if (round + 1) % 4 == 0 {
            let injection = (round + 1) / 4;
            x0 = x0.wrapping_add(schedule[injection % 3]);
            x1 = x1.wrapping_add(schedule[(injection + 1) % 3].wrapping_add(injection as u32));
        }
    }
    [x0, x1]
}

/// Uniform samples in `[0, 1)` with the shape and dtype of `like`.
pub fn uniform_like(like: &TensorValue, seed: u64) -> Result<TensorValue, EvalError> {
    let key = [(seed >> 32) as u32, seed as u32];
    let data = (0..like.len() as u64)
        .map(|i| {
            let [hi, lo] = threefry2x32(key, [(i >> 32) as u32, i as u32]);
            // 53 random mantissa bits.
            let bits = (u64::from(hi) << 21) ^ u64::from(lo >> 11);
            (bits & ((1_u64 << 53) - 1)) as f64 / (1_u64 << 53) as f64
        })
        .collect();
    Ok(TensorValue::new(like.dtype, like.shape.clone(), data)?)
}
