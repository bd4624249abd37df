//! Convolution, normalization and bias kernels, plus the fused forms the
//! optimizer rewrites single-consumer chains into.
//!
//! Direct convolution composes the scalar accumulate loop; the per-channel
//! batch-norm epilogue and the bias rows go through the vectorized
//! elementwise primitives, so a fused node runs the exact arithmetic of the
//! chain it replaced.

use crate::capability::SimdLevel;

macro_rules! nn_kernels {
    (
        $ty:ty, $conv:ident, $bias_add:ident, $bias_add_assign:ident,
        $batch_norm:ident, $batch_norm_assign:ident, $conv_bn_relu:ident, $matmul_bias:ident,
        $add:path, $add_assign:path, $affine:path, $affine_assign:path, $affine_relu_assign:path,
        $matmul:path
    ) => {
        /// Direct convolution over `[n,c,h,w]` input with `[o,c,kh,kw]`
        /// filters, zero padding.
        pub fn $conv(
            x: &[$ty],
            w: &[$ty],
            out: &mut [$ty],
            x_dims: [usize; 4],
            w_dims: [usize; 4],
            stride: (usize, usize),
            padding: (usize, usize),
        ) {
            let [n, c, h, wd] = x_dims;
            let [o, _, kh, kw] = w_dims;
            let (sh, sw) = stride;
            let (ph, pw) = padding;
            let oh = (h + 2 * ph - kh) / sh + 1;
            let ow = (wd + 2 * pw - kw) / sw + 1;
            for ni in 0..n {
                for oi in 0..o {
                    for y in 0..oh {
                        for xo in 0..ow {
                            let mut acc: $ty = 0.0;
                            for ci in 0..c {
                                for ky in 0..kh {
                                    let iy = y * sh + ky;
                                    if iy < ph || iy - ph >= h {
                                        continue;
                                    }
                                    let iy = iy - ph;
                                    for kx in 0..kw {
                                        let ix = xo * sw + kx;
                                        if ix < pw || ix - pw >= wd {
                                            continue;
                                        }
                                        let ix = ix - pw;
                                        acc += x[((ni * c + ci) * h + iy) * wd + ix]
                                            * w[((oi * c + ci) * kh + ky) * kw + kx];
                                    }
                                }
                            }
                            out[((ni * o + oi) * oh + y) * ow + xo] = acc;
                        }
                    }
                }
            }
        }

        /// Adds a `[cols]` bias row to every row of a `[rows,cols]` operand.
        pub fn $bias_add(x: &[$ty], bias: &[$ty], out: &mut [$ty], rows: usize, cols: usize, level: SimdLevel) {
            for row in 0..rows {
                $add(&x[row * cols..][..cols], bias, &mut out[row * cols..][..cols], level);
            }
        }

        pub fn $bias_add_assign(out: &mut [$ty], bias: &[$ty], rows: usize, cols: usize, level: SimdLevel) {
            for row in 0..rows {
                $add_assign(&mut out[row * cols..][..cols], bias, level);
            }
        }

        /// Inference batch normalization over `[n,c,...]` data: each channel
        /// plane gets `x * gamma/sqrt(var+eps) + (beta - mean*gamma/sqrt(var+eps))`.
        pub fn $batch_norm(
            x: &[$ty],
            gamma: &[$ty],
            beta: &[$ty],
            mean: &[$ty],
            var: &[$ty],
            epsilon: f64,
            out: &mut [$ty],
            n: usize,
            c: usize,
            plane: usize,
            level: SimdLevel,
        ) {
            for ni in 0..n {
                for ci in 0..c {
                    let s = gamma[ci] / (var[ci] + epsilon as $ty).sqrt();
                    let t = beta[ci] - mean[ci] * s;
                    let off = (ni * c + ci) * plane;
                    $affine(&x[off..][..plane], &mut out[off..][..plane], s, t, level);
                }
            }
        }

        pub fn $batch_norm_assign(
            out: &mut [$ty],
            gamma: &[$ty],
            beta: &[$ty],
            mean: &[$ty],
            var: &[$ty],
            epsilon: f64,
            n: usize,
            c: usize,
            plane: usize,
            level: SimdLevel,
        ) {
            for ni in 0..n {
                for ci in 0..c {
                    let s = gamma[ci] / (var[ci] + epsilon as $ty).sqrt();
                    let t = beta[ci] - mean[ci] * s;
                    let off = (ni * c + ci) * plane;
                    $affine_assign(&mut out[off..][..plane], s, t, level);
                }
            }
        }

        /// Fused Conv -> BatchNorm -> ReLU: the convolution writes the
        /// output once, then each channel plane gets the normalization
        /// affine and the zero clamp in a single pass.
        pub fn $conv_bn_relu(
            x: &[$ty],
            w: &[$ty],
            gamma: &[$ty],
            beta: &[$ty],
            mean: &[$ty],
            var: &[$ty],
            epsilon: f64,
            out: &mut [$ty],
            x_dims: [usize; 4],
            w_dims: [usize; 4],
            stride: (usize, usize),
            padding: (usize, usize),
            level: SimdLevel,
        ) {
            $conv(x, w, out, x_dims, w_dims, stride, padding);
            let [n, _, h, wd] = x_dims;
            let [o, _, kh, kw] = w_dims;
            let (sh, sw) = stride;
            let (ph, pw) = padding;
            let plane = ((h + 2 * ph - kh) / sh + 1) * ((wd + 2 * pw - kw) / sw + 1);
            for ni in 0..n {
                for oi in 0..o {
                    let s = gamma[oi] / (var[oi] + epsilon as $ty).sqrt();
                    let t = beta[oi] - mean[oi] * s;
                    let off = (ni * o + oi) * plane;
                    $affine_relu_assign(&mut out[off..][..plane], s, t, level);
                }
            }
        }

        /// Fused MatMul -> BiasAdd.
        pub fn $matmul_bias(
            a: &[$ty],
            b: &[$ty],
            bias: &[$ty],
            out: &mut [$ty],
            m: usize,
            n: usize,
            k: usize,
            level: SimdLevel,
        ) {
            $matmul(a, b, out, m, n, k, level);
            $bias_add_assign(out, bias, m, n, level);
        }
    };
}

nn_kernels!(
    f32, conv2d_f32, bias_add_f32, bias_add_assign_f32,
    batch_norm_f32, batch_norm_assign_f32, conv_bn_relu_f32, matmul_bias_f32,
    crate::elementwise::add_f32, crate::elementwise::add_assign_f32,
    crate::elementwise::affine_f32, crate::elementwise::affine_assign_f32,
    crate::elementwise::affine_relu_assign_f32,
    crate::matmul::matmul_f32
);
nn_kernels!(
    f64, conv2d_f64, bias_add_f64, bias_add_assign_f64,
    batch_norm_f64, batch_norm_assign_f64, conv_bn_relu_f64, matmul_bias_f64,
    crate::elementwise::add_f64, crate::elementwise::add_assign_f64,
    crate::elementwise::affine_f64, crate::elementwise::affine_assign_f64,
    crate::elementwise::affine_relu_assign_f64,
    crate::matmul::matmul_f64
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conv_sums_receptive_field() {
        // 1x1x3x3 of ones through a 1x1x2x2 ones filter: every output
        // element sums a full 2x2 window.
        let x = [1.0f32; 9];
        let w = [1.0f32; 4];
        let mut out = [0.0f32; 4];
        conv2d_f32(&x, &w, &mut out, [1, 1, 3, 3], [1, 1, 2, 2], (1, 1), (0, 0));
        assert_eq!(out, [4.0; 4]);
    }

    #[test]
    fn padded_strided_conv_hits_borders() {
        // 1x1x2x2 input [[1,2],[3,4]], 1x1x2x2 ones filter, stride 2 with
        // one pixel of padding: each output sees exactly one input element.
        let x = [1.0f32, 2.0, 3.0, 4.0];
        let w = [1.0f32; 4];
        let mut out = [0.0f32; 4];
        conv2d_f32(&x, &w, &mut out, [1, 1, 2, 2], [1, 1, 2, 2], (2, 2), (1, 1));
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn batch_norm_identity_params_pass_through() {
        let x = [0.5f32, -1.0, 2.0, 8.0];
        let mut out = [0.0f32; 4];
        batch_norm_f32(
            &x, &[1.0], &[0.0], &[0.0], &[1.0], 0.0, &mut out, 1, 1, 4,
            SimdLevel::detect(),
        );
        assert_eq!(out, x);
    }

    #[test]
    fn batch_norm_normalizes_channel_stats() {
        // mean 2, var 4: (x - 2) / 2.
        let x = [0.0f32, 2.0, 4.0, 6.0];
        let mut out = [0.0f32; 4];
        batch_norm_f32(
            &x, &[1.0], &[0.0], &[2.0], &[4.0], 0.0, &mut out, 1, 1, 4,
            SimdLevel::detect(),
        );
        for (got, want) in out.iter().zip(&[-1.0f32, 0.0, 1.0, 2.0]) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn fused_matmul_bias_matches_sequence() {
        let level = SimdLevel::detect();
        let a: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..12).map(|i| (i as f32) * 0.5).collect();
        let bias = [10.0f32, 20.0, 30.0, 40.0];

        let mut fused = vec![0.0f32; 8];
        matmul_bias_f32(&a, &b, &bias, &mut fused, 2, 4, 3, level);

        let mut staged = vec![0.0f32; 8];
        crate::matmul::matmul_f32(&a, &b, &mut staged, 2, 4, 3, level);
        let product = staged.clone();
        bias_add_f32(&product, &bias, &mut staged, 2, 4, level);

        assert_eq!(fused, staged);
    }
}
