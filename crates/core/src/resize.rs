//! Bilinear resampling of NCHW tensors.

use ndarray::{Array4, ArrayView4};

/// Source sample positions and weights for one output axis, using pixel-centre
/// alignment (corners are not pinned).
fn axis_taps(src: usize, dst: usize) -> Vec<(usize, usize, f64)> {
    (0..dst)
        .map(|d| {
            let pos = (d as f64 + 0.5) * src as f64 / dst as f64 - 0.5;
            let i0 = pos.floor().max(0.0) as usize;
            let i0 = i0.min(src - 1);
            let i1 = (i0 + 1).min(src - 1);
            let frac = (pos - i0 as f64).clamp(0.0, 1.0);
            (i0, i1, frac)
        })
        .collect()
}

/// Resize every `(batch, channel)` plane of `input` to `dst_h x dst_w`.
pub fn resize_bilinear(input: &ArrayView4<'_, f64>, dst_h: usize, dst_w: usize) -> Array4<f64> {
    let (n, c, src_h, src_w) = input.dim();
    if n == 0 || c == 0 || src_h == 0 || src_w == 0 {
        return Array4::zeros((n, c, dst_h, dst_w));
    }
    let rows = axis_taps(src_h, dst_h);
    let cols = axis_taps(src_w, dst_w);

    Array4::from_shape_fn((n, c, dst_h, dst_w), |(b, ch, y, x)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let p00 = input[[b, ch, y0, x0]];
        let p10 = input[[b, ch, y0, x1]];
        let p01 = input[[b, ch, y1, x0]];
        let p11 = input[[b, ch, y1, x1]];

        let top = p00 * (1.0 - fx) + p10 * fx;
        let bot = p01 * (1.0 - fx) + p11 * fx;
        top * (1.0 - fy) + bot * fy
    })
}
