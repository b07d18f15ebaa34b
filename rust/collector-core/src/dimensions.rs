// rust/collector-core/src/dimensions.rs

//! Three-axis extents, offsets, strides and grid positions.
//!
//! Axis 0 varies fastest in memory and on disk. A zero-valued `Dimensions`
//! stands for "unspecified, use the default" wherever an API accepts one.

use std::fmt;
use std::ops::{Add, Index, IndexMut, Sub};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Maximum dataset rank supported by the collector.
pub const MAX_RANK: u32 = 3;

/// An ordered triple of unsigned extents.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable,
)]
pub struct Dimensions(pub [u64; 3]);

impl Dimensions {
    pub const fn new(x: u64, y: u64, z: u64) -> Self {
        Self([x, y, z])
    }

    pub const fn splat(value: u64) -> Self {
        Self([value; 3])
    }

    pub const fn zero() -> Self {
        Self::splat(0)
    }

    pub const fn ones() -> Self {
        Self::splat(1)
    }

    /// Number of elements covered by these extents, saturating at `u64::MAX`.
    pub fn product(&self) -> u64 {
        self.0.iter().fold(1u64, |acc, &v| acc.saturating_mul(v))
    }

    /// Number of elements, or `None` if it does not fit in a `u64`.
    pub fn checked_product(&self) -> Option<u64> {
        self.0.iter().try_fold(1u64, |acc, &v| acc.checked_mul(v))
    }

    /// Element-wise sum, or `None` if any axis overflows.
    pub fn checked_add(&self, rhs: Dimensions) -> Option<Dimensions> {
        Some(Self([
            self.0[0].checked_add(rhs.0[0])?,
            self.0[1].checked_add(rhs.0[1])?,
            self.0[2].checked_add(rhs.0[2])?,
        ]))
    }

    /// Returns true if every axis is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&v| v == 0)
    }

    /// Copy with every axis at or beyond `rank` replaced by `fill`.
    #[must_use]
    pub fn normalized(mut self, rank: u32, fill: u64) -> Self {
        for axis in (rank as usize).min(3)..3 {
            self.0[axis] = fill;
        }
        self
    }

    /// Returns true if `self[i] <= other[i]` on every axis.
    pub fn fits_within(&self, other: &Dimensions) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a <= b)
    }

    /// Returns true if a box of these extents placed at `offset` lies inside
    /// `bounds`. An end coordinate past `u64::MAX` never fits.
    pub fn fits_at(&self, offset: Dimensions, bounds: &Dimensions) -> bool {
        offset
            .checked_add(*self)
            .is_some_and(|end| end.fits_within(bounds))
    }

    pub fn as_array(&self) -> [u64; 3] {
        self.0
    }
}

impl From<[u64; 3]> for Dimensions {
    fn from(value: [u64; 3]) -> Self {
        Self(value)
    }
}

impl Index<usize> for Dimensions {
    type Output = u64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl IndexMut<usize> for Dimensions {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.0[index]
    }
}

/// Saturating element-wise sum.
impl Add for Dimensions {
    type Output = Dimensions;

    fn add(self, rhs: Self) -> Self::Output {
        Self([
            self.0[0].saturating_add(rhs.0[0]),
            self.0[1].saturating_add(rhs.0[1]),
            self.0[2].saturating_add(rhs.0[2]),
        ])
    }
}

/// Saturating element-wise difference.
impl Sub for Dimensions {
    type Output = Dimensions;

    fn sub(self, rhs: Self) -> Self::Output {
        Self([
            self.0[0].saturating_sub(rhs.0[0]),
            self.0[1].saturating_sub(rhs.0[1]),
            self.0[2].saturating_sub(rhs.0[2]),
        ])
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0[0], self.0[1], self.0[2])
    }
}

/// Linear element index of `position` inside a box of extents `shape`
/// (axis 0 fastest).
pub fn linear_index(position: Dimensions, shape: Dimensions) -> u64 {
    position[0] + shape[0] * (position[1] + shape[1] * position[2])
}

/// Maps a process rank to its position in the process grid.
///
/// The grid is unraveled row-major with axis 0 fastest:
/// `x = r % gx`, `y = (r / gx) % gy`, `z = r / (gx * gy)`.
/// Grid axes of zero are treated as one.
pub fn rank_to_position(rank: u64, grid: Dimensions) -> Dimensions {
    let gx = grid[0].max(1);
    let gy = grid[1].max(1);
    Dimensions::new(rank % gx, (rank / gx) % gy, rank / (gx * gy))
}

/// Inverse of [`rank_to_position`].
pub fn position_to_rank(position: Dimensions, grid: Dimensions) -> u64 {
    let gx = grid[0].max(1);
    let gy = grid[1].max(1);
    position[0] + gx * (position[1] + gy * position[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_and_zero() {
        assert_eq!(Dimensions::new(4, 4, 1).product(), 16);
        assert_eq!(Dimensions::new(4, 0, 1).product(), 0);
        assert!(Dimensions::zero().is_zero());
        assert!(!Dimensions::new(0, 0, 1).is_zero());
    }

    #[test]
    fn test_normalized() {
        let d = Dimensions::new(8, 3, 7).normalized(1, 1);
        assert_eq!(d, Dimensions::new(8, 1, 1));
        let d = Dimensions::new(8, 3, 7).normalized(2, 0);
        assert_eq!(d, Dimensions::new(8, 3, 0));
        assert_eq!(Dimensions::new(1, 2, 3).normalized(3, 9), Dimensions::new(1, 2, 3));
    }

    #[test]
    fn test_arithmetic() {
        let a = Dimensions::new(5, 5, 5);
        let b = Dimensions::new(1, 2, 6);
        assert_eq!(a + b, Dimensions::new(6, 7, 11));
        assert_eq!(a - b, Dimensions::new(4, 3, 0));
        assert!(b.fits_within(&Dimensions::new(1, 2, 6)));
        assert!(!b.fits_within(&a));
    }

    #[test]
    fn test_overflow_never_fits() {
        let huge = Dimensions::new(u64::MAX, 0, 0);
        let two = Dimensions::new(2, 1, 1);
        assert_eq!(huge.checked_add(two), None);
        assert!(!two.fits_at(huge, &Dimensions::new(4, 1, 1)));
        assert!(two.fits_at(Dimensions::new(2, 0, 0), &Dimensions::new(4, 1, 1)));
        assert_eq!(huge + two, Dimensions::new(u64::MAX, 1, 1));

        let wide = Dimensions::new(u64::MAX, 2, 1);
        assert_eq!(wide.checked_product(), None);
        assert_eq!(wide.product(), u64::MAX);
        assert_eq!(Dimensions::new(u64::MAX, 0, 1).checked_product(), Some(0));
    }

    #[test]
    fn test_linear_index() {
        let shape = Dimensions::new(4, 3, 2);
        assert_eq!(linear_index(Dimensions::zero(), shape), 0);
        assert_eq!(linear_index(Dimensions::new(1, 0, 0), shape), 1);
        assert_eq!(linear_index(Dimensions::new(0, 1, 0), shape), 4);
        assert_eq!(linear_index(Dimensions::new(3, 2, 1), shape), 23);
    }

    #[test]
    fn test_display() {
        assert_eq!(Dimensions::new(8, 4, 1).to_string(), "(8, 4, 1)");
    }

    #[test]
    fn test_rank_to_position_row_major() {
        let grid = Dimensions::new(2, 3, 2);
        assert_eq!(rank_to_position(0, grid), Dimensions::new(0, 0, 0));
        assert_eq!(rank_to_position(1, grid), Dimensions::new(1, 0, 0));
        assert_eq!(rank_to_position(2, grid), Dimensions::new(0, 1, 0));
        assert_eq!(rank_to_position(5, grid), Dimensions::new(1, 2, 0));
        assert_eq!(rank_to_position(6, grid), Dimensions::new(0, 0, 1));
        assert_eq!(rank_to_position(11, grid), Dimensions::new(1, 2, 1));
    }

    #[test]
    fn test_position_roundtrip_covers_grid() {
        let grid = Dimensions::new(3, 2, 2);
        for rank in 0..grid.product() {
            let pos = rank_to_position(rank, grid);
            assert!(pos[0] < 3 && pos[1] < 2 && pos[2] < 2);
            assert_eq!(position_to_rank(pos, grid), rank);
        }
    }
}
