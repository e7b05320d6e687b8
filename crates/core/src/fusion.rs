//! Batch of patches -> full image, averaging the overlap bands.

use anyhow::{bail, Result};
use ndarray::{s, Array2, Array4, ArrayView4};
use tracing::trace;

use crate::geometry::PatchGeometry;
use crate::tiling::tile_view;

/// Inverse of [`crate::tiling::tile_batch`].
///
/// Each patch loses its `boundary_pix` margin (and, for the last patch on an
/// axis, everything past `residual`) before being summed into place. The sum
/// is divided by the per-pixel contribution count, so overlap bands are
/// averaged and singly-covered pixels pass through unchanged.
pub fn fuse_batch(
    patches: &ArrayView4<'_, f64>,
    geometry: &PatchGeometry,
    batch_size: usize,
) -> Result<Array4<f64>> {
    let (rows, channels, patch_h, patch_w) = patches.dim();
    let expected_rows = geometry.tile_count() * batch_size;
    if rows != expected_rows || patch_h != geometry.y.patch || patch_w != geometry.x.patch {
        bail!(
            "geometry mismatch: patch batch has shape {:?}, geometry expects [{expected_rows}, _, {}, {}]",
            patches.shape(),
            geometry.y.patch,
            geometry.x.patch
        );
    }

    let img_h = geometry.y.image;
    let img_w = geometry.x.image;
    let mut output = Array4::<f64>::zeros((batch_size, channels, img_h, img_w));
    let mut count_map = Array2::<f64>::zeros((img_h, img_w));

    for (tile_x, tile_y) in geometry.tiles() {
        let (src_y, dst_y) = geometry.y.interior(tile_y);
        let (src_x, dst_x) = geometry.x.interior(tile_x);
        let tile = tile_view(patches, geometry, batch_size, tile_x, tile_y);

        let mut region = output.slice_mut(s![.., .., dst_y.clone(), dst_x.clone()]);
        region += &tile.slice(s![.., .., src_y, src_x]);
        count_map
            .slice_mut(s![dst_y, dst_x])
            .mapv_inplace(|count| count + 1.0);
    }

    if let Some(((y, x), _)) = count_map.indexed_iter().find(|(_, count)| **count == 0.0) {
        bail!("geometry invariant violated: pixel ({y}, {x}) is not covered by any patch");
    }
    trace!(
        max_overlap = count_map.iter().cloned().fold(0.0, f64::max),
        "Fused patch batch"
    );

    for mut image in output.outer_iter_mut() {
        for mut plane in image.outer_iter_mut() {
            plane /= &count_map;
        }
    }

    Ok(output)
}
