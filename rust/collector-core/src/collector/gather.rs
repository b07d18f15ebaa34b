// rust/collector-core/src/collector/gather.rs

//! Collective computation of global dataset geometry.
//!
//! Every process contributes its local extent; after one all-gather each
//! process derives the global shape and its own offset from the rank-ordered
//! extents alone. Placement is therefore a pure function of the gathered
//! values and identical on every process, whatever order they arrived in.
//!
//! Rank-1 datasets are laid out along axis 0 in rank order. Higher-rank
//! datasets follow the process grid: along each axis `d`, a process sits
//! after the processes of its grid line that have a lower position on `d`.

use tracing::debug;

use crate::comm::Communicator;
use crate::dimensions::{rank_to_position, Dimensions};
use crate::error::{CollectorError, Result};
use crate::topology::ProcessTopology;

/// Global shape of a dataset and the offset of one process's part in it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalGeometry {
    pub size: Dimensions,
    pub offset: Dimensions,
}

impl GlobalGeometry {
    pub fn new(size: Dimensions, offset: Dimensions) -> Self {
        Self { size, offset }
    }
}

/// Computes the placement of `my_rank` from the rank-ordered local extents.
///
/// `extents[i]` is the local extent of rank `i`, with axes at or beyond
/// `rank` already set to 1.
///
/// # Errors
///
/// Returns `GeometryMismatch` if processes disagree on an axis they share,
/// or if the process grid extends along an axis the dataset does not have.
pub fn compute_placement(
    extents: &[Dimensions],
    grid: Dimensions,
    my_rank: u64,
    rank: u32,
) -> Result<GlobalGeometry> {
    let me = my_rank as usize;
    let mine = extents.get(me).copied().ok_or_else(|| {
        CollectorError::geometry(format!(
            "rank {my_rank} missing from {} gathered extents",
            extents.len()
        ))
    })?;

    if rank <= 1 {
        let size = checked_sum(extents.iter().map(|e| e[0]))?;
        let offset = checked_sum(extents[..me].iter().map(|e| e[0]))?;
        return Ok(GlobalGeometry::new(
            Dimensions::new(size, mine[1], mine[2]),
            Dimensions::new(offset, 0, 0),
        ));
    }

    let dims = rank as usize;
    if let Some(axis) = (dims..3).find(|&axis| grid[axis] > 1) {
        return Err(CollectorError::geometry(format!(
            "process grid {grid} extends along axis {axis} but the dataset has rank {rank}"
        )));
    }
    if grid.product() as usize != extents.len() {
        return Err(CollectorError::geometry(format!(
            "process grid {grid} does not match {} gathered extents",
            extents.len()
        )));
    }

    let positions: Vec<Dimensions> = (0..extents.len() as u64)
        .map(|r| rank_to_position(r, grid))
        .collect();
    let my_pos = positions[me];

    let mut size = mine;
    let mut offset = Dimensions::zero();
    for axis in 0..dims {
        // Width of every grid slab along `axis`, fixed by its first rank that
        // contributes elements. Ranks contributing nothing take no space.
        let mut widths: Vec<Option<u64>> = vec![None; grid[axis].max(1) as usize];
        for (r, (extent, pos)) in extents.iter().zip(&positions).enumerate() {
            if extent.product() == 0 {
                continue;
            }
            let Some(width) = widths.get_mut(pos[axis] as usize) else {
                continue;
            };
            let current = *width;
            match current {
                None => *width = Some(extent[axis]),
                Some(reference) if reference != extent[axis] => {
                    return Err(CollectorError::geometry(format!(
                        "rank {r} contributes extent {} along axis {axis}, \
                         but its grid slab has extent {reference}",
                        extent[axis]
                    )));
                }
                Some(_) => {}
            }
        }

        let below = (my_pos[axis] as usize).min(widths.len());
        size[axis] = checked_sum(widths.iter().map(|w| w.unwrap_or(0)))?;
        offset[axis] = checked_sum(widths[..below].iter().map(|w| w.unwrap_or(0)))?;
    }

    Ok(GlobalGeometry::new(size, offset))
}

fn checked_sum(values: impl Iterator<Item = u64>) -> Result<u64> {
    let mut total = 0u64;
    for value in values {
        total = total.checked_add(value).ok_or_else(|| {
            CollectorError::geometry("gathered extents overflow the global dataset size")
        })?;
    }
    Ok(total)
}

/// Marks a gathered extent as coming from a process that rejected its own
/// arguments.
const REJECTED: u64 = 1;

/// Gathers local extents from every process and computes this process's
/// placement. Collective.
///
/// `local` is this process's extent, or `None` if its own arguments failed
/// validation. Every process takes part in the all-gather either way, so a
/// local failure never leaves the others waiting.
///
/// # Errors
///
/// Returns a backend error if communication fails, and `GeometryMismatch`
/// if any process rejected its arguments or the extents are inconsistent.
/// All processes fail together.
pub fn gather(
    comm: &dyn Communicator,
    topology: &ProcessTopology,
    local: Option<Dimensions>,
    rank: u32,
) -> Result<GlobalGeometry> {
    let (extent, status) = match local {
        Some(extent) => (extent, 0),
        None => (Dimensions::zero(), REJECTED),
    };
    let gathered = comm.all_gather(&[extent[0], extent[1], extent[2], status])?;

    let mut extents = Vec::with_capacity(gathered.len() / 4);
    for (r, c) in gathered.chunks_exact(4).enumerate() {
        if c[3] == REJECTED {
            return Err(CollectorError::geometry(format!(
                "rank {r} rejected its local arguments"
            )));
        }
        extents.push(Dimensions::new(c[0], c[1], c[2]));
    }

    let geometry = compute_placement(&extents, topology.grid, topology.rank, rank)?;
    debug!(
        rank = topology.rank,
        local = %extent,
        size = %geometry.size,
        offset = %geometry.offset,
        "Gathered dataset geometry"
    );
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn d(x: u64, y: u64, z: u64) -> Dimensions {
        Dimensions::new(x, y, z)
    }

    #[test]
    fn test_rank1_prefix_sums() {
        let extents = [d(3, 1, 1), d(0, 1, 1), d(5, 1, 1), d(2, 1, 1)];
        let grid = d(4, 1, 1);
        let offsets: Vec<u64> = (0..4)
            .map(|r| compute_placement(&extents, grid, r, 1).unwrap())
            .map(|g| {
                assert_eq!(g.size, d(10, 1, 1));
                g.offset[0]
            })
            .collect();
        assert_eq!(offsets, vec![0, 3, 3, 8]);
    }

    #[test]
    fn test_rank1_ignores_grid_shape() {
        let extents = [d(2, 1, 1), d(2, 1, 1), d(2, 1, 1), d(2, 1, 1)];
        let g = compute_placement(&extents, d(2, 2, 1), 3, 1).unwrap();
        assert_eq!(g, GlobalGeometry::new(d(8, 1, 1), d(6, 0, 0)));
    }

    #[test]
    fn test_two_ranks_along_x() {
        let extents = [d(4, 4, 1), d(4, 4, 1)];
        let grid = d(2, 1, 1);
        let g0 = compute_placement(&extents, grid, 0, 2).unwrap();
        let g1 = compute_placement(&extents, grid, 1, 2).unwrap();
        assert_eq!(g0, GlobalGeometry::new(d(8, 4, 1), d(0, 0, 0)));
        assert_eq!(g1, GlobalGeometry::new(d(8, 4, 1), d(4, 0, 0)));
    }

    #[test]
    fn test_2x2_grid_uneven_slabs() {
        // Columns of width 3 and 5, rows of height 2 and 4
        let extents = [d(3, 2, 1), d(5, 2, 1), d(3, 4, 1), d(5, 4, 1)];
        let grid = d(2, 2, 1);
        let expected_offsets = [d(0, 0, 0), d(3, 0, 0), d(0, 2, 0), d(3, 2, 0)];
        for (r, expected) in expected_offsets.iter().enumerate() {
            let g = compute_placement(&extents, grid, r as u64, 2).unwrap();
            assert_eq!(g.size, d(8, 6, 1));
            assert_eq!(g.offset, *expected);
        }
    }

    #[test]
    fn test_3d_grid() {
        let extents: Vec<Dimensions> = (0..8).map(|_| d(2, 3, 4)).collect();
        let grid = d(2, 2, 2);
        let g = compute_placement(&extents, grid, 7, 3).unwrap();
        assert_eq!(g, GlobalGeometry::new(d(4, 6, 8), d(2, 3, 4)));
    }

    #[test]
    fn test_mismatched_shared_axis() {
        let extents = [d(4, 4, 1), d(4, 5, 1)];
        for r in 0..2 {
            let err = compute_placement(&extents, d(2, 1, 1), r, 2).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::GeometryMismatch);
        }
    }

    #[test]
    fn test_zero_extent_rank_is_exempt() {
        let extents = [d(4, 4, 1), d(0, 0, 1), d(0, 0, 0)];
        let g = compute_placement(&extents, d(3, 1, 1), 0, 2).unwrap();
        assert_eq!(g.size, d(4, 4, 1));
        let all_zero = [d(0, 0, 1), d(0, 0, 1)];
        let g = compute_placement(&all_zero, d(2, 1, 1), 1, 2).unwrap();
        assert_eq!(g.size.product(), 0);
    }

    #[test]
    fn test_idle_first_rank_takes_no_space() {
        let extents = [d(0, 0, 1), d(4, 3, 1)];
        let grid = d(2, 1, 1);
        let g0 = compute_placement(&extents, grid, 0, 2).unwrap();
        let g1 = compute_placement(&extents, grid, 1, 2).unwrap();
        assert_eq!(g0.size, d(4, 3, 1));
        assert_eq!(g1, GlobalGeometry::new(d(4, 3, 1), d(0, 0, 0)));
    }

    #[test]
    fn test_idle_rank_in_2x2_grid() {
        // Rank 1 sits at (1, 0); rank 3 alone fixes the width of column 1
        let extents = [d(3, 2, 1), d(0, 0, 1), d(3, 4, 1), d(5, 4, 1)];
        let grid = d(2, 2, 1);
        let g3 = compute_placement(&extents, grid, 3, 2).unwrap();
        assert_eq!(g3, GlobalGeometry::new(d(8, 6, 1), d(3, 2, 0)));
        let g0 = compute_placement(&extents, grid, 0, 2).unwrap();
        assert_eq!(g0, GlobalGeometry::new(d(8, 6, 1), d(0, 0, 0)));
    }

    #[test]
    fn test_overflowing_extents() {
        let extents = [d(u64::MAX, 1, 1), d(2, 1, 1)];
        let err = compute_placement(&extents, d(2, 1, 1), 1, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryMismatch);
    }

    #[test]
    fn test_rejected_local_arguments() {
        let topology = ProcessTopology::new(0, 1, d(1, 1, 1)).unwrap();
        let err = gather(&crate::comm::SoloCommunicator, &topology, None, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryMismatch);
        assert!(err.to_string().contains("rank 0 rejected"));
    }

    #[test]
    fn test_grid_beyond_dataset_rank() {
        let extents = [d(4, 4, 1), d(4, 4, 1)];
        let err = compute_placement(&extents, d(1, 1, 2), 0, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GeometryMismatch);
    }
}
