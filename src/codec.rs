//! Float memory optimization codec.
//!
//! Backends with 8-bit-per-channel output cells cannot hold a 32-bit float
//! directly. With the codec, a kernel writes the four bytes of each result's
//! IEEE-754 bit pattern into the four channels of its cell, and readback puts
//! the bytes back together. The round trip is bit-exact for every value.
//!
//! Channel order is fixed: bits 0–7 go to `r`, 8–15 to `g`, 16–23 to `b`
//! and 24–31 to `a`.
//!
//! Storage is a 2-D grid of cells, so each output rank has its own mapping:
//!
//! | rank | extents     | cell of `(x, y, z)` | grid        |
//! |------|-------------|---------------------|-------------|
//! | 1    | `[X]`       | `(x, 0)`            | `X × 1`     |
//! | 2    | `[X, Y]`    | `(x, y)`            | `X × Y`     |
//! | 3    | `[X, Y, Z]` | `(x, y + z·Y)`      | `X × (Y·Z)` |

use crate::array::Array;
use crate::error::{Error, Result};
use crate::output::Rank;

/// Bytes per packed cell.
pub const CHANNELS: usize = 4;

/// Rank-specific encode/decode pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Rank 1 outputs, one row of cells.
    Rank1,
    /// Rank 2 outputs, cell `(x, y)`.
    Rank2,
    /// Rank 3 outputs, Z slices stacked along y.
    Rank3,
}

/// Splits a float into its four channel bytes.
#[inline]
#[must_use]
pub const fn pack(value: f32) -> [u8; CHANNELS] {
    value.to_bits().to_le_bytes()
}

/// Reassembles a float from four channel bytes.
#[inline]
#[must_use]
pub const fn unpack(texel: [u8; CHANNELS]) -> f32 {
    f32::from_bits(u32::from_le_bytes(texel))
}

impl Codec {
    /// The variant for an output rank.
    #[must_use]
    pub const fn for_rank(rank: Rank) -> Self {
        match rank {
            Rank::One => Self::Rank1,
            Rank::Two => Self::Rank2,
            Rank::Three => Self::Rank3,
        }
    }

    /// The rank this variant handles.
    #[must_use]
    pub const fn rank(self) -> Rank {
        match self {
            Self::Rank1 => Rank::One,
            Self::Rank2 => Rank::Two,
            Self::Rank3 => Rank::Three,
        }
    }

    /// Grid cell holding output coordinate `(x, y, z)`.
    #[must_use]
    pub fn cell(self, extents: &[usize], x: usize, y: usize, z: usize) -> (usize, usize) {
        match self {
            Self::Rank1 => (x, 0),
            Self::Rank2 => (x, y),
            Self::Rank3 => (x, y + z * extents.get(1).copied().unwrap_or(1)),
        }
    }

    /// Encodes a whole output into grid-ordered texel bytes.
    ///
    /// This is the host mirror of what the device writes in
    /// [`Codec::wgsl_pack`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOutputShape`] if `values` has the wrong rank or is
    /// ragged.
    pub fn encode(self, values: &Array) -> Result<Vec<u8>> {
        let extents = values.extents();
        if values.rank() != self.rank() as usize {
            return Err(Error::shape(&extents, format!("{self:?} cannot encode this rank")));
        }
        values.validate().map_err(|reason| Error::shape(&extents, reason))?;

        let width = extents[0];
        let mut texels = vec![0u8; values.len() * CHANNELS];
        let mut put = |(cx, cy): (usize, usize), v: f32| {
            let at = (cy * width + cx) * CHANNELS;
            texels[at..at + CHANNELS].copy_from_slice(&pack(v));
        };
        match values {
            Array::One(xs) => {
                for (x, &v) in xs.iter().enumerate() {
                    put(self.cell(&extents, x, 0, 0), v);
                }
            }
            Array::Two(rows) => {
                for (y, row) in rows.iter().enumerate() {
                    for (x, &v) in row.iter().enumerate() {
                        put(self.cell(&extents, x, y, 0), v);
                    }
                }
            }
            Array::Three(slices) => {
                for (z, slice) in slices.iter().enumerate() {
                    for (y, row) in slice.iter().enumerate() {
                        for (x, &v) in row.iter().enumerate() {
                            put(self.cell(&extents, x, y, z), v);
                        }
                    }
                }
            }
        }
        Ok(texels)
    }

    /// Decodes grid-ordered texel bytes back into a nested array.
    ///
    /// # Errors
    ///
    /// [`Error::ReadbackFailure`] if `texels` does not cover the grid, and
    /// [`Error::InvalidOutputShape`] if `extents` does not match this
    /// variant's rank.
    pub fn decode(self, texels: &[u8], extents: &[usize]) -> Result<Array> {
        if extents.len() != self.rank() as usize {
            return Err(Error::shape(extents, format!("{self:?} cannot decode this rank")));
        }
        let cells: usize = extents.iter().product();
        if texels.len() != cells * CHANNELS {
            return Err(Error::ReadbackFailure(format!(
                "expected {} texel bytes, got {}",
                cells * CHANNELS,
                texels.len()
            )));
        }

        let width = extents[0];
        let read = |(cx, cy): (usize, usize)| {
            let at = (cy * width + cx) * CHANNELS;
            let mut texel = [0u8; CHANNELS];
            texel.copy_from_slice(&texels[at..at + CHANNELS]);
            unpack(texel)
        };
        Ok(match self {
            Self::Rank1 => Array::One(
                (0..width)
                    .map(|x| read(self.cell(extents, x, 0, 0)))
                    .collect(),
            ),
            Self::Rank2 => Array::Two(
                (0..extents[1])
                    .map(|y| {
                        (0..width)
                            .map(|x| read(self.cell(extents, x, y, 0)))
                            .collect()
                    })
                    .collect(),
            ),
            Self::Rank3 => Array::Three(
                (0..extents[2])
                    .map(|z| {
                        (0..extents[1])
                            .map(|y| {
                                (0..width)
                                    .map(|x| read(self.cell(extents, x, y, z)))
                                    .collect()
                            })
                            .collect()
                    })
                    .collect(),
            ),
        })
    }

    /// WGSL that turns `value: f32` into the `vec4<u32>` texel written to an
    /// `rgba8uint` cell.
    #[must_use]
    pub const fn wgsl_pack() -> &'static str {
        "fn pack_float(value: f32) -> vec4<u32> {\n    \
         let bits = bitcast<u32>(value);\n    \
         return vec4<u32>(bits & 0xffu, (bits >> 8u) & 0xffu, (bits >> 16u) & 0xffu, bits >> 24u);\n\
         }\n"
    }

    /// WGSL that reads a float back out of a `vec4<u32>` texel, used when a
    /// packed output feeds another kernel without leaving the device.
    #[must_use]
    pub const fn wgsl_unpack() -> &'static str {
        "fn unpack_float(texel: vec4<u32>) -> f32 {\n    \
         return bitcast<f32>((texel.r & 0xffu) | ((texel.g & 0xffu) << 8u) | ((texel.b & 0xffu) << 16u) | ((texel.a & 0xffu) << 24u));\n\
         }\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    #[test]
    fn pack_uses_little_endian_channels() {
        assert_eq!(pack(1.0), [0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(unpack([0x00, 0x00, 0x80, 0x3f]), 1.0);
    }

    #[test]
    fn every_finite_bit_pattern_sample_survives() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..100_000 {
            let v = f32::from_bits(rng.random::<u32>());
            if !v.is_finite() {
                continue;
            }
            assert_eq!(unpack(pack(v)).to_bits(), v.to_bits());
        }
        for v in [0.0, -0.0, f32::MIN, f32::MAX, f32::MIN_POSITIVE, f32::EPSILON, 16_777_216.0] {
            assert_eq!(unpack(pack(v)).to_bits(), v.to_bits());
        }
    }

    #[test]
    fn rank1_round_trip() {
        let values = Array::from(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let texels = Codec::Rank1.encode(&values).unwrap();
        assert_eq!(texels.len(), 5 * CHANNELS);
        assert_eq!(Codec::Rank1.decode(&texels, &[5]).unwrap(), values);
    }

    #[test]
    fn rank2_round_trip() {
        let values = Array::from_flat(&[5, 3], (1..=15).map(|v| v as f32).collect()).unwrap();
        let texels = Codec::Rank2.encode(&values).unwrap();
        assert_eq!(Codec::Rank2.decode(&texels, &[5, 3]).unwrap(), values);
    }

    #[test]
    fn rank3_round_trip_inverts_tiling() {
        let mut rng = StdRng::seed_from_u64(7);
        let data: Vec<f32> = (0..5 * 3 * 2).map(|_| rng.random_range(-1e6..1e6)).collect();
        let values = Array::from_flat(&[5, 3, 2], data).unwrap();
        let texels = Codec::Rank3.encode(&values).unwrap();
        assert_eq!(Codec::Rank3.decode(&texels, &[5, 3, 2]).unwrap(), values);
    }

    #[test]
    fn rank3_cells_stack_slices() {
        let extents = [5, 3, 2];
        assert_eq!(Codec::Rank3.cell(&extents, 0, 0, 1), (0, 3));
        assert_eq!(Codec::Rank3.cell(&extents, 4, 2, 1), (4, 5));
        assert_eq!(Codec::Rank1.cell(&[9], 8, 0, 0), (8, 0));
    }

    #[test]
    fn decode_rejects_short_readback() {
        let err = Codec::Rank2.decode(&[0; 12], &[2, 2]).unwrap_err();
        assert!(matches!(err, Error::ReadbackFailure(_)));
        assert!(Codec::Rank1.decode(&[0; 16], &[2, 2]).is_err());
    }

    #[test]
    fn encode_checks_rank() {
        assert!(Codec::Rank2.encode(&Array::from(vec![1.0])).is_err());
    }
}
