//! Host-side numeric containers.
//!
//! [`Array`] is what a materialized kernel result looks like: nested vectors,
//! outermost dimension first, so a rank 3 value is indexed `[z][y][x]`.
//! Extents, on the other hand, are always reported x first, the same order
//! kernels are configured with, so `result.extents() == config.output()`.

use crate::error::{Error, Result};

/// A rank 1, 2 or 3 array of `f32`, stored as nested rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    /// `[x]`
    One(Vec<f32>),
    /// `[y][x]`
    Two(Vec<Vec<f32>>),
    /// `[z][y][x]`
    Three(Vec<Vec<Vec<f32>>>),
}

impl Array {
    /// Number of dimensions (1, 2 or 3).
    #[must_use]
    pub const fn rank(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Two(_) => 2,
            Self::Three(_) => 3,
        }
    }

    /// Extents, x first.
    ///
    /// Ragged arrays report the length of their first row; use
    /// [`Array::validate`] to reject them.
    #[must_use]
    pub fn extents(&self) -> Vec<usize> {
        match self {
            Self::One(xs) => vec![xs.len()],
            Self::Two(rows) => vec![rows.first().map_or(0, Vec::len), rows.len()],
            Self::Three(slices) => {
                let rows = slices.first().map_or(0, Vec::len);
                let cols = slices
                    .first()
                    .and_then(|s| s.first())
                    .map_or(0, Vec::len);
                vec![cols, rows, slices.len()]
            }
        }
    }

    /// Total number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extents().iter().product()
    }

    /// Whether the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that every row and slice has the same length and that no
    /// extent is zero.
    ///
    /// # Errors
    ///
    /// Returns a description of the first irregularity found.
    pub fn validate(&self) -> core::result::Result<(), String> {
        let extents = self.extents();
        if extents.contains(&0) {
            return Err(format!("array has an empty dimension {extents:?}"));
        }
        match self {
            Self::One(_) => Ok(()),
            Self::Two(rows) => check_rows(rows, extents[0], "row"),
            Self::Three(slices) => slices.iter().enumerate().try_for_each(|(z, slice)| {
                if slice.len() != extents[1] {
                    return Err(format!(
                        "slice {z} has {} rows, expected {}",
                        slice.len(),
                        extents[1]
                    ));
                }
                check_rows(slice, extents[0], "row")
            }),
        }
    }

    /// Row-major copy of the data (`x` varies fastest).
    #[must_use]
    pub fn flatten(&self) -> Vec<f32> {
        match self {
            Self::One(xs) => xs.clone(),
            Self::Two(rows) => rows.concat(),
            Self::Three(slices) => slices.iter().flat_map(|s| s.concat()).collect(),
        }
    }

    /// Rebuilds a nested array from row-major data.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOutputShape`] if `extents` is not rank 1–3, has a zero
    /// extent, or does not describe exactly `data.len()` elements.
    pub fn from_flat(extents: &[usize], data: Vec<f32>) -> Result<Self> {
        if extents.contains(&0) {
            return Err(Error::shape(extents, "extents must be positive"));
        }
        let expected = crate::output::addressable_cells(extents)?;
        if expected != data.len() {
            return Err(Error::shape(
                extents,
                format!("expected {expected} elements, got {}", data.len()),
            ));
        }
        match *extents {
            [_] => Ok(Self::One(data)),
            [x, _] => Ok(Self::Two(data.chunks(x).map(<[f32]>::to_vec).collect())),
            [x, y, _] => Ok(Self::Three(
                data.chunks(x * y)
                    .map(|slice| slice.chunks(x).map(<[f32]>::to_vec).collect())
                    .collect(),
            )),
            _ => Err(Error::shape(extents, "rank must be 1, 2 or 3")),
        }
    }

    /// Element at `[z][y][x]`; unused outer coordinates are ignored.
    #[must_use]
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        match self {
            Self::One(xs) => xs.get(x).copied(),
            Self::Two(rows) => rows.get(y)?.get(x).copied(),
            Self::Three(slices) => slices.get(z)?.get(y)?.get(x).copied(),
        }
    }

    /// The data as a vector, if this is a rank 1 array.
    #[must_use]
    pub fn as_1d(&self) -> Option<&[f32]> {
        match self {
            Self::One(xs) => Some(xs),
            _ => None,
        }
    }

    /// The rows, if this is a rank 2 array.
    #[must_use]
    pub fn as_2d(&self) -> Option<&[Vec<f32>]> {
        match self {
            Self::Two(rows) => Some(rows),
            _ => None,
        }
    }

    /// The slices, if this is a rank 3 array.
    #[must_use]
    pub fn as_3d(&self) -> Option<&[Vec<Vec<f32>>]> {
        match self {
            Self::Three(slices) => Some(slices),
            _ => None,
        }
    }
}

fn check_rows(rows: &[Vec<f32>], width: usize, what: &str) -> core::result::Result<(), String> {
    match rows.iter().position(|r| r.len() != width) {
        Some(i) => Err(format!(
            "{what} {i} has {} elements, expected {width}",
            rows[i].len()
        )),
        None => Ok(()),
    }
}

impl From<Vec<f32>> for Array {
    fn from(xs: Vec<f32>) -> Self {
        Self::One(xs)
    }
}

impl From<Vec<Vec<f32>>> for Array {
    fn from(rows: Vec<Vec<f32>>) -> Self {
        Self::Two(rows)
    }
}

impl From<Vec<Vec<Vec<f32>>>> for Array {
    fn from(slices: Vec<Vec<Vec<f32>>>) -> Self {
        Self::Three(slices)
    }
}

impl<const N: usize> From<[f32; N]> for Array {
    fn from(xs: [f32; N]) -> Self {
        Self::One(xs.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube() -> Array {
        Array::from_flat(&[5, 3, 2], (1..=30).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn extents_are_x_first() {
        assert_eq!(Array::from(vec![1.0, 2.0]).extents(), vec![2]);
        assert_eq!(Array::from(vec![vec![0.0; 5]; 3]).extents(), vec![5, 3]);
        assert_eq!(cube().extents(), vec![5, 3, 2]);
    }

    #[test]
    fn from_flat_nests_outermost_first() {
        let c = cube();
        let slices = c.as_3d().unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0][0], vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(slices[1][2], vec![26.0, 27.0, 28.0, 29.0, 30.0]);
        assert_eq!(c.get(4, 1, 1), Some(25.0));
        assert_eq!(c.flatten(), (1..=30).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn from_flat_rejects_wrong_sizes() {
        assert!(Array::from_flat(&[2, 2], vec![1.0; 3]).is_err());
        assert!(Array::from_flat(&[1, 1, 1, 1], vec![1.0]).is_err());
        assert!(matches!(
            Array::from_flat(&[usize::MAX, 2], vec![1.0]),
            Err(Error::InvalidOutputShape { .. })
        ));
    }

    #[test]
    fn validate_catches_ragged_rows() {
        let ragged = Array::from(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(ragged.validate().unwrap_err().contains("row 1"));
        assert!(Array::from(Vec::<f32>::new()).validate().is_err());
        assert!(cube().validate().is_ok());
    }
}
