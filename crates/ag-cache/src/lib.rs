#![forbid(unsafe_code)]

mod compile_cache;

pub use compile_cache::{CacheLookup, CompileCache};

use ag_core::{Shape, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a traced function. Two wrappers around the same function
/// share compiled variants only if they report the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub u64);

impl FunctionId {
    /// Derives an id from a stable name: the first eight bytes of its sha256.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn#{:016x}", self.0)
    }
}

/// How much of each argument's layout is baked into a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HasherKind {
    /// Full sizes and strides: one compiled variant per concrete shape.
    #[default]
    StaticShape,
    /// Only rank plus per-dimension size/stride classes.
    DynamicShape,
}

impl HasherKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaticShape => "static",
            Self::DynamicShape => "dynamic",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "static" | "static_shape" => Some(Self::StaticShape),
            "dynamic" | "dynamic_shape" => Some(Self::DynamicShape),
            _ => None,
        }
    }

    fn tag(self) -> i64 {
        match self {
            Self::DynamicShape => 0,
            Self::StaticShape => 1,
        }
    }
}

// Per-dimension classes recorded by the dynamic hasher.
const SIZE_MISSING: i64 = 1 << 0;
const SIZE_ONE: i64 = 1 << 1;
const SIZE_OTHER: i64 = 1 << 2;
const STRIDE_ZERO: i64 = 1 << 3;
const STRIDE_ONE: i64 = 1 << 4;
const STRIDE_CONTIGUOUS: i64 = 1 << 5;
const STRIDE_TRANSPOSED_CONTIGUOUS: i64 = 1 << 6;
const STRIDE_AS_ARG: i64 = 1 << 7;

// Leading word for argument kinds that carry no strides.
const SCALAR_TAG: i64 = 2;
const DIMS_TAG: i64 = 3;

/// Size and stride class of every dimension.
#[must_use]
pub fn dim_flags(sizes: &[u64], strides: &[u64]) -> Vec<i64> {
    let mut flags: Vec<i64> = Vec::with_capacity(sizes.len());
    for dim in 0..sizes.len() {
        let mut flag = match sizes[dim] {
            0 => SIZE_MISSING,
            1 => SIZE_ONE,
            _ => SIZE_OTHER,
        };
        let stride = strides.get(dim).copied().unwrap_or(0);
        flag |= if stride == 0 {
            STRIDE_ZERO
        } else if stride == 1 {
            STRIDE_ONE
        } else if dim + 1 < sizes.len() && stride == strides[dim + 1] * sizes[dim + 1] {
            STRIDE_CONTIGUOUS
        } else if dim > 0
            && stride == strides[dim - 1] * sizes[dim - 1]
            && flags[dim - 1] & STRIDE_CONTIGUOUS == 0
        {
            STRIDE_TRANSPOSED_CONTIGUOUS
        } else {
            STRIDE_AS_ARG
        };
        flags.push(flag);
    }
    flags
}

/// Packs dtype and the requires-grad bit into one word.
fn pack_flags(dtype_code: i64, requires_grad: bool) -> i64 {
    i64::from(requires_grad) | (dtype_code << 1)
}

fn shape_words(shape: &Shape) -> (Vec<u64>, Vec<u64>) {
    let sizes = shape.dims.iter().map(|&dim| u64::from(dim)).collect();
    (sizes, shape.contiguous_strides())
}

fn to_word(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Signature words for one argument. Tensors are treated as requiring
/// gradients, since every tensor argument is a primal of the joint graph.
#[must_use]
pub fn argument_signature(hasher: HasherKind, value: &Value) -> Vec<i64> {
    match value {
        Value::Tensor(tensor) => {
            let (sizes, strides) = shape_words(&tensor.shape);
            let mut words = vec![
                hasher.tag(),
                pack_flags(tensor.dtype.code(), true),
                to_word(sizes.len() as u64),
            ];
            match hasher {
                HasherKind::StaticShape => {
                    words.extend(sizes.iter().copied().map(to_word));
                    words.extend(strides.iter().copied().map(to_word));
                }
                HasherKind::DynamicShape => words.extend(dim_flags(&sizes, &strides)),
            }
            words
        }
        Value::Scalar(lit) => vec![SCALAR_TAG, pack_flags(lit.dtype().code(), false)],
        Value::Dims(shape) => {
            let mut words = vec![DIMS_TAG, to_word(shape.dims.len() as u64)];
            if hasher == HasherKind::StaticShape {
                words.extend(shape.dims.iter().map(|&dim| i64::from(dim)));
            }
            words
        }
    }
}

/// Structural cache key: function identity, argument count and the
/// concatenated per-argument signatures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub function: FunctionId,
    pub num_args: usize,
    pub hasher: HasherKind,
    pub signature: Vec<i64>,
}

impl CacheKey {
    /// Hex sha256 over the key's words, prefixed with `agc-`.
    #[must_use]
    pub fn digest_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.function.0.to_be_bytes());
        hasher.update((self.num_args as u64).to_be_bytes());
        hasher.update(self.hasher.as_str().as_bytes());
        for word in &self.signature {
            hasher.update(word.to_be_bytes());
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(4 + digest.len() * 2);
        out.push_str("agc-");
        for byte in &digest {
            let _ = fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
        }
        out
    }
}

#[must_use]
pub fn build_cache_key(function: FunctionId, hasher: HasherKind, args: &[Value]) -> CacheKey {
    let signature = args
        .iter()
        .flat_map(|arg| argument_signature(hasher, arg))
        .collect();
    CacheKey {
        function,
        num_args: args.len(),
        hasher,
        signature,
    }
}
