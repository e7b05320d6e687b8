//! Patch grid geometry shared by the tiler and the fuser.
//!
//! A [`PatchGeometry`] is computed once per sampling call and handed to both
//! [`crate::tiling`] and [`crate::fusion`], so the two sides can never disagree
//! about tile counts, padding, or the flat batch layout.

use std::fmt;
use std::ops::Range;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Spatial extent of an image or a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape2 {
    pub height: usize,
    pub width: usize,
}

impl Shape2 {
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub const fn square(size: usize) -> Self {
        Self::new(size, size)
    }
}

impl fmt::Display for Shape2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Tiling layout along one spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AxisGeometry {
    /// Extent of the unpadded image.
    pub image: usize,
    /// Extent of a single patch.
    pub patch: usize,
    /// Distance between the starts of consecutive patches.
    pub stride: usize,
    /// Number of patches along this axis.
    pub count: usize,
    /// Extent of the reflection-padded image the patches are cut from.
    pub padded: usize,
    /// Leading reflection margin (equals the boundary width).
    pub pad_before: usize,
    /// Trailing reflection margin.
    pub pad_after: usize,
    /// Image pixels contributed by the last patch.
    pub residual: usize,
    boundary: usize,
}

impl AxisGeometry {
    fn new(
        axis: &str,
        image: usize,
        patch: usize,
        overlap_pix: usize,
        boundary_pix: usize,
    ) -> Result<Self> {
        if image == 0 {
            bail!("image {axis} must be positive");
        }
        if patch == 0 {
            bail!("patch {axis} must be positive");
        }
        if overlap_pix >= patch {
            bail!("overlap_pix ({overlap_pix}) must be smaller than patch {axis} ({patch})");
        }
        if boundary_pix >= patch {
            bail!("boundary_pix ({boundary_pix}) must be smaller than patch {axis} ({patch})");
        }
        let Some(stride) = patch
            .checked_sub(overlap_pix + boundary_pix)
            .filter(|stride| *stride > 0)
        else {
            bail!(
                "patch {axis} ({patch}) leaves no stride after overlap_pix ({overlap_pix}) and boundary_pix ({boundary_pix})"
            );
        };
        // The cropped interiors of neighbouring patches only meet when the
        // overlap is at least as wide as the cropped boundary.
        if overlap_pix < boundary_pix {
            bail!(
                "overlap_pix ({overlap_pix}) must be at least boundary_pix ({boundary_pix}) or fused pixels are left uncovered"
            );
        }

        let count = image.div_ceil(stride);
        let padded = stride * (count - 1) + patch + boundary_pix;
        let pad_after = padded - image - boundary_pix;
        let residual = patch - pad_after;

        Ok(Self {
            image,
            patch,
            stride,
            count,
            padded,
            pad_before: boundary_pix,
            pad_after,
            residual,
            boundary: boundary_pix,
        })
    }

    /// A single patch covering the whole axis with no padding.
    fn whole(axis: &str, image: usize) -> Result<Self> {
        if image == 0 {
            bail!("image {axis} must be positive");
        }
        Ok(Self {
            image,
            patch: image,
            stride: image,
            count: 1,
            padded: image,
            pad_before: 0,
            pad_after: 0,
            residual: image,
            boundary: 0,
        })
    }

    /// Offset of patch `index` inside the padded image.
    pub fn start(&self, index: usize) -> usize {
        index * self.stride
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 == self.count
    }

    /// Trusted part of patch `index`: the range inside the patch and the
    /// range of image pixels it lands on.
    ///
    /// The boundary margin is always cropped; the last patch is further cut
    /// to `residual` so nothing from the trailing padding reaches the image.
    pub fn interior(&self, index: usize) -> (Range<usize>, Range<usize>) {
        let dst_start = self.start(index);
        let len = if self.is_last(index) {
            self.residual
        } else {
            (self.patch - 2 * self.boundary).min(self.image - dst_start)
        };
        (
            self.boundary..self.boundary + len,
            dst_start..dst_start + len,
        )
    }
}

/// Full 2-D tiling layout for one image/patch configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PatchGeometry {
    pub y: AxisGeometry,
    pub x: AxisGeometry,
    pub overlap_pix: usize,
    pub boundary_pix: usize,
}

impl PatchGeometry {
    /// Validate the parameters and derive the grid. No tensor is touched here,
    /// so configuration errors surface before anything is allocated.
    ///
    /// When `patch == img` tiling is bypassed, so `overlap_pix` and
    /// `boundary_pix` are recorded but not checked.
    pub fn new(img: Shape2, patch: Shape2, overlap_pix: usize, boundary_pix: usize) -> Result<Self> {
        if img == patch {
            return Ok(Self {
                y: AxisGeometry::whole("height", img.height)?,
                x: AxisGeometry::whole("width", img.width)?,
                overlap_pix,
                boundary_pix,
            });
        }
        Ok(Self {
            y: AxisGeometry::new("height", img.height, patch.height, overlap_pix, boundary_pix)?,
            x: AxisGeometry::new("width", img.width, patch.width, overlap_pix, boundary_pix)?,
            overlap_pix,
            boundary_pix,
        })
    }

    pub fn image_shape(&self) -> Shape2 {
        Shape2::new(self.y.image, self.x.image)
    }

    pub fn patch_shape(&self) -> Shape2 {
        Shape2::new(self.y.patch, self.x.patch)
    }

    pub fn padded_shape(&self) -> Shape2 {
        Shape2::new(self.y.padded, self.x.padded)
    }

    /// True when the patch covers the image exactly and tiling is skipped.
    pub fn is_passthrough(&self) -> bool {
        self.patch_shape() == self.image_shape()
    }

    pub fn tile_count(&self) -> usize {
        self.x.count * self.y.count
    }

    /// Flat tile index of grid cell `(tile_x, tile_y)`: x-major, then y.
    pub fn tile_index(&self, tile_x: usize, tile_y: usize) -> usize {
        debug_assert!(tile_x < self.x.count && tile_y < self.y.count);
        tile_x * self.y.count + tile_y
    }

    /// Rows of the patch batch that hold grid cell `(tile_x, tile_y)`.
    pub fn batch_range(&self, tile_x: usize, tile_y: usize, batch_size: usize) -> Range<usize> {
        let start = self.tile_index(tile_x, tile_y) * batch_size;
        start..start + batch_size
    }

    /// Grid cells in batch order.
    pub fn tiles(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.x.count).flat_map(move |tile_x| (0..self.y.count).map(move |tile_y| (tile_x, tile_y)))
    }
}
