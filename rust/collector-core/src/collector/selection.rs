// rust/collector-core/src/collector/selection.rs

//! Memory-side selections: which elements of a caller's buffer take part in
//! a transfer.

use crate::dimensions::{linear_index, Dimensions};
use crate::error::{CollectorError, Result};

/// Describes the part of a local buffer that is written.
///
/// * `extent`: number of elements transferred along each axis.
/// * `buffer`: allocated shape of the buffer; zero means "just large enough".
/// * `offset`: first selected element inside the buffer.
/// * `stride`: step between selected elements; zero axes count as 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryLayout {
    pub extent: Dimensions,
    pub buffer: Dimensions,
    pub offset: Dimensions,
    pub stride: Dimensions,
}

impl MemoryLayout {
    /// The whole buffer is the data.
    pub fn contiguous(extent: Dimensions) -> Self {
        Self {
            extent,
            ..Default::default()
        }
    }

    /// `extent` elements at `offset` inside a larger buffer of shape `buffer`.
    pub fn with_buffer(extent: Dimensions, buffer: Dimensions, offset: Dimensions) -> Self {
        Self {
            extent,
            buffer,
            offset,
            stride: Dimensions::ones(),
        }
    }

    /// Strided selection inside a buffer of shape `buffer`.
    pub fn with_stride(
        extent: Dimensions,
        buffer: Dimensions,
        offset: Dimensions,
        stride: Dimensions,
    ) -> Self {
        Self {
            extent,
            buffer,
            offset,
            stride,
        }
    }

    /// Fills defaults for a dataset of `rank` and checks that the selection
    /// fits in the buffer.
    ///
    /// # Errors
    ///
    /// Returns `GeometryMismatch` if the selection overruns the buffer.
    pub fn resolve(&self, rank: u32) -> Result<MemoryLayout> {
        let extent = self.extent.normalized(rank, 1);
        let mut stride = self.stride;
        let mut offset = self.offset.normalized(rank, 0);
        for axis in 0..3 {
            stride[axis] = stride[axis].max(1);
        }
        let needed = span(extent, offset, stride).ok_or_else(|| {
            CollectorError::geometry(format!(
                "selection of extent {extent} at offset {offset} with stride {stride} \
                 overflows the addressable range"
            ))
        })?;

        let buffer = if self.buffer.is_zero() {
            needed
        } else {
            self.buffer.normalized(rank, 1)
        };
        if extent.product() > 0 && !needed.fits_within(&buffer) {
            return Err(CollectorError::geometry(format!(
                "selection of extent {extent} at offset {offset} with stride {stride} \
                 overruns buffer {buffer}"
            )));
        }
        if extent.product() == 0 {
            offset = Dimensions::zero();
        }

        Ok(MemoryLayout {
            extent,
            buffer,
            offset,
            stride,
        })
    }

    /// Returns true if the selection is one contiguous run of the buffer.
    fn is_contiguous(&self) -> bool {
        self.stride == Dimensions::ones() && self.extent == self.buffer
    }
}

/// Shape of the smallest box holding a strided selection, `None` on overflow.
fn span(extent: Dimensions, offset: Dimensions, stride: Dimensions) -> Option<Dimensions> {
    let mut out = Dimensions::zero();
    for axis in 0..3 {
        out[axis] = if extent[axis] == 0 {
            offset[axis]
        } else {
            (extent[axis] - 1)
                .checked_mul(stride[axis])?
                .checked_add(offset[axis])?
                .checked_add(1)?
        };
    }
    Some(out)
}

/// Checks that `len` bytes hold a buffer of `shape` elements of `elem` bytes.
pub fn check_buffer_len(len: usize, shape: Dimensions, elem: usize) -> Result<()> {
    let needed = shape
        .checked_product()
        .and_then(|count| usize::try_from(count).ok())
        .and_then(|count| count.checked_mul(elem))
        .ok_or_else(|| {
            CollectorError::geometry(format!("buffer of shape {shape} exceeds the address space"))
        })?;
    if len < needed {
        return Err(CollectorError::geometry(format!(
            "buffer of shape {shape} needs {needed} bytes, got {len}"
        )));
    }
    Ok(())
}

/// Copies the selected elements of `data` into a contiguous block of
/// `layout.extent` elements. `layout` must be resolved.
pub fn pack(data: &[u8], elem: usize, layout: &MemoryLayout) -> Result<Vec<u8>> {
    check_buffer_len(data.len(), layout.buffer, elem)?;
    let extent = layout.extent;
    let total = extent.product() as usize * elem;
    if layout.is_contiguous() {
        return Ok(data[..total].to_vec());
    }

    let mut out = Vec::with_capacity(total);
    for z in 0..extent[2] {
        for y in 0..extent[1] {
            if layout.stride[0] == 1 {
                let start = linear_index(
                    Dimensions::new(
                        layout.offset[0],
                        layout.offset[1] + y * layout.stride[1],
                        layout.offset[2] + z * layout.stride[2],
                    ),
                    layout.buffer,
                ) as usize
                    * elem;
                out.extend_from_slice(&data[start..start + extent[0] as usize * elem]);
                continue;
            }
            for x in 0..extent[0] {
                let pos = Dimensions::new(
                    layout.offset[0] + x * layout.stride[0],
                    layout.offset[1] + y * layout.stride[1],
                    layout.offset[2] + z * layout.stride[2],
                );
                let start = linear_index(pos, layout.buffer) as usize * elem;
                out.extend_from_slice(&data[start..start + elem]);
            }
        }
    }
    Ok(out)
}

/// Copies a contiguous block of `extent` elements into `dst`, a buffer of
/// shape `dst_buffer`, starting at `dst_offset`.
pub fn scatter(
    block: &[u8],
    elem: usize,
    extent: Dimensions,
    dst: &mut [u8],
    dst_buffer: Dimensions,
    dst_offset: Dimensions,
) -> Result<()> {
    if !extent.fits_at(dst_offset, &dst_buffer) {
        return Err(CollectorError::geometry(format!(
            "destination offset {dst_offset} with extent {extent} overruns buffer {dst_buffer}"
        )));
    }
    check_buffer_len(dst.len(), dst_buffer, elem)?;
    check_buffer_len(block.len(), extent, elem)?;

    let row = extent[0] as usize * elem;
    for z in 0..extent[2] {
        for y in 0..extent[1] {
            let src = linear_index(Dimensions::new(0, y, z), extent) as usize * elem;
            let dst_start = linear_index(dst_offset + Dimensions::new(0, y, z), dst_buffer)
                as usize
                * elem;
            dst[dst_start..dst_start + row].copy_from_slice(&block[src..src + row]);
        }
    }
    Ok(())
}
