//! Full image -> batch of overlapping patches.

use anyhow::{bail, Result};
use ndarray::{s, Array4, ArrayView4, Axis};
use tracing::trace;

use crate::geometry::PatchGeometry;

/// Mirror an out-of-range coordinate back into `0..len` without repeating the
/// edge sample, the same way a reflection pad does. Offsets larger than the
/// extent keep bouncing between the two edges.
pub(crate) fn reflect_index(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let folded = index.rem_euclid(period);
    if folded >= len as isize {
        (period - folded) as usize
    } else {
        folded as usize
    }
}

/// Reflection-pad the spatial axes of an NCHW tensor.
pub fn reflection_pad<A: Clone>(
    input: &ArrayView4<'_, A>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
) -> Array4<A> {
    let (n, c, h, w) = input.dim();
    let out_h = h + top + bottom;
    let out_w = w + left + right;
    let rows: Vec<usize> = (0..out_h)
        .map(|y| reflect_index(y as isize - top as isize, h))
        .collect();
    let cols: Vec<usize> = (0..out_w)
        .map(|x| reflect_index(x as isize - left as isize, w))
        .collect();

    Array4::from_shape_fn((n, c, out_h, out_w), |(b, ch, y, x)| {
        input[[b, ch, rows[y], cols[x]]].clone()
    })
}

/// Split `input` into the patch batch described by `geometry`.
///
/// The output has `geometry.tile_count() * batch_size` rows, grouped by tile
/// (see [`PatchGeometry::batch_range`]). When `input_interp` is given it must
/// already have patch resolution and `batch_size` rows; its channels are
/// appended to every tile.
pub fn tile_batch<A: Clone + Default>(
    input: &ArrayView4<'_, A>,
    geometry: &PatchGeometry,
    batch_size: usize,
    input_interp: Option<&ArrayView4<'_, A>>,
) -> Result<Array4<A>> {
    let (n, channels, h, w) = input.dim();
    if n != batch_size {
        bail!("tile_batch: input batch {n} does not match batch_size {batch_size}");
    }
    if (h, w) != (geometry.y.image, geometry.x.image) {
        bail!(
            "tile_batch: input is {h}x{w} but geometry expects {}",
            geometry.image_shape()
        );
    }

    let patch_h = geometry.y.patch;
    let patch_w = geometry.x.patch;
    let interp_channels = match input_interp {
        Some(interp) => {
            let (ib, ic, ih, iw) = interp.dim();
            if ib != batch_size || ih != patch_h || iw != patch_w {
                bail!(
                    "tile_batch: input_interp has shape {:?}, expected [{batch_size}, _, {patch_h}, {patch_w}]",
                    interp.shape()
                );
            }
            ic
        }
        None => 0,
    };

    let padded = reflection_pad(
        input,
        geometry.y.pad_before,
        geometry.y.pad_after,
        geometry.x.pad_before,
        geometry.x.pad_after,
    );
    trace!(
        padded_h = geometry.y.padded,
        padded_w = geometry.x.padded,
        tiles = geometry.tile_count(),
        "Padded image for tiling"
    );

    let mut output = Array4::<A>::from_elem(
        (
            geometry.tile_count() * batch_size,
            channels + interp_channels,
            patch_h,
            patch_w,
        ),
        A::default(),
    );

    for (tile_x, tile_y) in geometry.tiles() {
        let y0 = geometry.y.start(tile_y);
        let x0 = geometry.x.start(tile_x);
        let rows = geometry.batch_range(tile_x, tile_y, batch_size);

        let mut slot = output.slice_mut(s![rows, .., .., ..]);
        slot.slice_mut(s![.., ..channels, .., ..])
            .assign(&padded.slice(s![.., .., y0..y0 + patch_h, x0..x0 + patch_w]));
        if let Some(interp) = input_interp {
            slot.slice_mut(s![.., channels.., .., ..]).assign(interp);
        }
    }

    Ok(output)
}

/// Reassemble the flat patch batch into a `(tiles_y, tiles_x)` view per batch
/// element. Handy for inspecting a batch in tests and debugging tools.
pub fn tile_view<'a, A>(
    patches: &'a ArrayView4<'a, A>,
    geometry: &PatchGeometry,
    batch_size: usize,
    tile_x: usize,
    tile_y: usize,
) -> ArrayView4<'a, A> {
    let rows = geometry.batch_range(tile_x, tile_y, batch_size);
    patches.slice_axis(Axis(0), rows.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Shape2;
    use ndarray::Array;

    fn ramp(n: usize, c: usize, h: usize, w: usize) -> Array4<f64> {
        Array::from_shape_fn((n, c, h, w), |(b, ch, y, x)| {
            (b * 1000 + ch * 100 + y * 10 + x) as f64
        })
    }

    #[test]
    fn reflect_index_mirrors_without_edge_repeat() {
        assert_eq!(reflect_index(-1, 5), 1);
        assert_eq!(reflect_index(-2, 5), 2);
        assert_eq!(reflect_index(5, 5), 3);
        assert_eq!(reflect_index(6, 5), 2);
        assert_eq!(reflect_index(2, 5), 2);
        assert_eq!(reflect_index(-9, 1), 0);
    }

    #[test]
    fn reflect_index_bounces_past_extent() {
        // 0 1 2 | 1 0 1 2 1 0
        assert_eq!(reflect_index(3, 3), 1);
        assert_eq!(reflect_index(4, 3), 0);
        assert_eq!(reflect_index(5, 3), 1);
        assert_eq!(reflect_index(6, 3), 2);
    }

    #[test]
    fn reflection_pad_matches_mirror_layout() {
        let input = ramp(1, 1, 3, 4);
        let padded = reflection_pad(&input.view(), 1, 2, 2, 1);
        assert_eq!(padded.shape(), &[1, 1, 6, 7]);
        // top-left corner mirrors (row 1, col 2)
        assert_eq!(padded[[0, 0, 0, 0]], input[[0, 0, 1, 2]]);
        // interior is unchanged
        assert_eq!(padded[[0, 0, 1, 2]], input[[0, 0, 0, 0]]);
        // bottom rows mirror rows 1 and 0
        assert_eq!(padded[[0, 0, 4, 2]], input[[0, 0, 1, 0]]);
        assert_eq!(padded[[0, 0, 5, 2]], input[[0, 0, 0, 0]]);
        // right column mirrors col 2
        assert_eq!(padded[[0, 0, 1, 6]], input[[0, 0, 0, 2]]);
    }

    #[test]
    fn tiles_are_windows_of_padded_image() {
        let geom = PatchGeometry::new(Shape2::square(10), Shape2::square(6), 2, 1)
            .expect("valid geometry");
        let input = ramp(2, 3, 10, 10);
        let patches = tile_batch(&input.view(), &geom, 2, None).expect("tiling succeeds");
        assert_eq!(patches.shape(), &[geom.tile_count() * 2, 3, 6, 6]);

        let padded = reflection_pad(
            &input.view(),
            geom.y.pad_before,
            geom.y.pad_after,
            geom.x.pad_before,
            geom.x.pad_after,
        );
        for (tile_x, tile_y) in geom.tiles() {
            let view = patches.view();
            let tile = tile_view(&view, &geom, 2, tile_x, tile_y);
            let y0 = geom.y.start(tile_y);
            let x0 = geom.x.start(tile_x);
            assert_eq!(tile, padded.slice(s![.., .., y0..y0 + 6, x0..x0 + 6]));
        }
    }

    #[test]
    fn batch_elements_stay_contiguous_per_tile() {
        let geom = PatchGeometry::new(Shape2::square(10), Shape2::square(6), 2, 1)
            .expect("valid geometry");
        let input = ramp(3, 1, 10, 10);
        let patches = tile_batch(&input.view(), &geom, 3, None).expect("tiling succeeds");
        // second tile along y, batch element 2, first trusted pixel
        let row = geom.tile_index(0, 1) * 3 + 2;
        assert_eq!(patches[[row, 0, 1, 1]], input[[2, 0, geom.y.start(1), 0]]);
    }

    #[test]
    fn interp_channels_are_appended_to_every_tile() {
        let geom = PatchGeometry::new(Shape2::square(12), Shape2::square(6), 2, 1)
            .expect("valid geometry");
        let input = ramp(1, 2, 12, 12);
        let interp = Array4::<f64>::from_elem((1, 1, 6, 6), -7.0);
        let patches = tile_batch(&input.view(), &geom, 1, Some(&interp.view()))
            .expect("tiling succeeds");
        assert_eq!(patches.shape()[1], 3);
        for row in 0..geom.tile_count() {
            assert!(patches
                .slice(s![row, 2, .., ..])
                .iter()
                .all(|&v| v == -7.0));
        }
    }

    #[test]
    fn integer_grids_tile_like_images() {
        let geom = PatchGeometry::new(Shape2::square(9), Shape2::square(5), 2, 1)
            .expect("valid geometry");
        let grid = Array4::<i64>::from_shape_fn((1, 2, 9, 9), |(_, ch, y, x)| {
            if ch == 0 {
                y as i64
            } else {
                x as i64
            }
        });
        let patches = tile_batch(&grid.view(), &geom, 1, None).expect("tiling succeeds");
        let row = geom.tile_index(1, 0);
        // patch pixel 1 is image column `start`, the first trusted one
        assert_eq!(patches[[row, 1, 1, 1]], geom.x.start(1) as i64);
        assert_eq!(patches[[row, 0, 1, 1]], 0);
    }

    #[test]
    fn rejects_mismatched_input() {
        let geom = PatchGeometry::new(Shape2::square(10), Shape2::square(6), 2, 1)
            .expect("valid geometry");
        let input = ramp(1, 1, 9, 10);
        assert!(tile_batch(&input.view(), &geom, 1, None).is_err());

        let input = ramp(2, 1, 10, 10);
        assert!(tile_batch(&input.view(), &geom, 1, None).is_err());
    }

    #[test]
    fn rejects_interp_at_wrong_resolution() {
        let geom = PatchGeometry::new(Shape2::square(10), Shape2::square(6), 2, 1)
            .expect("valid geometry");
        let input = ramp(1, 1, 10, 10);
        let interp = Array4::<f64>::zeros((1, 1, 5, 6));
        assert!(tile_batch(&input.view(), &geom, 1, Some(&interp.view())).is_err());
    }
}
