//! Vectorized elementwise kernels with scalar tails.
//!
//! Every kernel takes the dispatch tier as an argument so the scalar
//! reference backend can pin the exact same code to the tail loops. Vector
//! bodies cover the lane-divisible prefix and finish the remainder with the
//! scalar expression. Add, mul, scale, neg and relu are bit-identical
//! between the tiers; the fused multiply-add family contracts the
//! intermediate rounding on both tiers (`mul_add` against `fmadd`), so it
//! is bit-identical as well.

use crate::capability::SimdLevel;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

macro_rules! binary_kernel {
    (
        $name:ident, $assign_name:ident, $ty:ty, $op:tt,
        ($load2:ident, $store2:ident, $vop2:ident, $lanes2:expr),
        ($load5:ident, $store5:ident, $vop5:ident, $lanes5:expr)
    ) => {
        pub fn $name(a: &[$ty], b: &[$ty], out: &mut [$ty], level: SimdLevel) {
            debug_assert!(a.len() == out.len() && b.len() == out.len());
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2")]
                unsafe fn avx2(a: &[$ty], b: &[$ty], out: &mut [$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let v = $vop2($load2(a.as_ptr().add(i)), $load2(b.as_ptr().add(i)));
                        $store2(out.as_mut_ptr().add(i), v);
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *a.get_unchecked(i) $op *b.get_unchecked(i);
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(a: &[$ty], b: &[$ty], out: &mut [$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let v = $vop5($load5(a.as_ptr().add(i)), $load5(b.as_ptr().add(i)));
                        $store5(out.as_mut_ptr().add(i), v);
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *a.get_unchecked(i) $op *b.get_unchecked(i);
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(a, b, out) },
                    SimdLevel::Avx2 => return unsafe { avx2(a, b, out) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for ((slot, &x), &y) in out.iter_mut().zip(a).zip(b) {
                *slot = x $op y;
            }
        }

        pub fn $assign_name(out: &mut [$ty], b: &[$ty], level: SimdLevel) {
            debug_assert_eq!(out.len(), b.len());
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2")]
                unsafe fn avx2(out: &mut [$ty], b: &[$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        let v = $vop2($load2(ptr), $load2(b.as_ptr().add(i)));
                        $store2(ptr, v);
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *out.get_unchecked(i) $op *b.get_unchecked(i);
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(out: &mut [$ty], b: &[$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        let v = $vop5($load5(ptr), $load5(b.as_ptr().add(i)));
                        $store5(ptr, v);
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *out.get_unchecked(i) $op *b.get_unchecked(i);
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(out, b) },
                    SimdLevel::Avx2 => return unsafe { avx2(out, b) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for (slot, &y) in out.iter_mut().zip(b) {
                *slot = *slot $op y;
            }
        }
    };
}

binary_kernel!(add_f32, add_assign_f32, f32, +,
    (_mm256_loadu_ps, _mm256_storeu_ps, _mm256_add_ps, 8),
    (_mm512_loadu_ps, _mm512_storeu_ps, _mm512_add_ps, 16));
binary_kernel!(mul_f32, mul_assign_f32, f32, *,
    (_mm256_loadu_ps, _mm256_storeu_ps, _mm256_mul_ps, 8),
    (_mm512_loadu_ps, _mm512_storeu_ps, _mm512_mul_ps, 16));
binary_kernel!(add_f64, add_assign_f64, f64, +,
    (_mm256_loadu_pd, _mm256_storeu_pd, _mm256_add_pd, 4),
    (_mm512_loadu_pd, _mm512_storeu_pd, _mm512_add_pd, 8));
binary_kernel!(mul_f64, mul_assign_f64, f64, *,
    (_mm256_loadu_pd, _mm256_storeu_pd, _mm256_mul_pd, 4),
    (_mm512_loadu_pd, _mm512_storeu_pd, _mm512_mul_pd, 8));

macro_rules! fma_kernel {
    (
        $name:ident, $assign_name:ident, $ty:ty,
        ($load2:ident, $store2:ident, $fmadd2:ident, $lanes2:expr),
        ($load5:ident, $store5:ident, $fmadd5:ident, $lanes5:expr)
    ) => {
        /// `out = a * b + c`, contracted to a single rounding per element.
        pub fn $name(a: &[$ty], b: &[$ty], c: &[$ty], out: &mut [$ty], level: SimdLevel) {
            debug_assert!(a.len() == out.len() && b.len() == out.len() && c.len() == out.len());
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2,fma")]
                unsafe fn avx2(a: &[$ty], b: &[$ty], c: &[$ty], out: &mut [$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let v = $fmadd2(
                            $load2(a.as_ptr().add(i)),
                            $load2(b.as_ptr().add(i)),
                            $load2(c.as_ptr().add(i)),
                        );
                        $store2(out.as_mut_ptr().add(i), v);
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) =
                            a.get_unchecked(i).mul_add(*b.get_unchecked(i), *c.get_unchecked(i));
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(a: &[$ty], b: &[$ty], c: &[$ty], out: &mut [$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let v = $fmadd5(
                            $load5(a.as_ptr().add(i)),
                            $load5(b.as_ptr().add(i)),
                            $load5(c.as_ptr().add(i)),
                        );
                        $store5(out.as_mut_ptr().add(i), v);
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) =
                            a.get_unchecked(i).mul_add(*b.get_unchecked(i), *c.get_unchecked(i));
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(a, b, c, out) },
                    SimdLevel::Avx2 => return unsafe { avx2(a, b, c, out) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for i in 0..out.len() {
                out[i] = a[i].mul_add(b[i], c[i]);
            }
        }

        /// `out = out * b + c`.
        pub fn $assign_name(out: &mut [$ty], b: &[$ty], c: &[$ty], level: SimdLevel) {
            debug_assert!(b.len() == out.len() && c.len() == out.len());
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2,fma")]
                unsafe fn avx2(out: &mut [$ty], b: &[$ty], c: &[$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        let v = $fmadd2($load2(ptr), $load2(b.as_ptr().add(i)), $load2(c.as_ptr().add(i)));
                        $store2(ptr, v);
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) =
                            out.get_unchecked(i).mul_add(*b.get_unchecked(i), *c.get_unchecked(i));
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(out: &mut [$ty], b: &[$ty], c: &[$ty]) {
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        let v = $fmadd5($load5(ptr), $load5(b.as_ptr().add(i)), $load5(c.as_ptr().add(i)));
                        $store5(ptr, v);
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) =
                            out.get_unchecked(i).mul_add(*b.get_unchecked(i), *c.get_unchecked(i));
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(out, b, c) },
                    SimdLevel::Avx2 => return unsafe { avx2(out, b, c) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for i in 0..out.len() {
                out[i] = out[i].mul_add(b[i], c[i]);
            }
        }
    };
}

fma_kernel!(fma_f32, fma_assign_f32, f32,
    (_mm256_loadu_ps, _mm256_storeu_ps, _mm256_fmadd_ps, 8),
    (_mm512_loadu_ps, _mm512_storeu_ps, _mm512_fmadd_ps, 16));
fma_kernel!(fma_f64, fma_assign_f64, f64,
    (_mm256_loadu_pd, _mm256_storeu_pd, _mm256_fmadd_pd, 4),
    (_mm512_loadu_pd, _mm512_storeu_pd, _mm512_fmadd_pd, 8));

macro_rules! scale_kernel {
    (
        $name:ident, $assign_name:ident, $ty:ty,
        ($load2:ident, $store2:ident, $set2:ident, $mul2:ident, $lanes2:expr),
        ($load5:ident, $store5:ident, $set5:ident, $mul5:ident, $lanes5:expr)
    ) => {
        pub fn $name(a: &[$ty], out: &mut [$ty], factor: $ty, level: SimdLevel) {
            debug_assert_eq!(a.len(), out.len());
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2")]
                unsafe fn avx2(a: &[$ty], out: &mut [$ty], factor: $ty) {
                    let f = $set2(factor);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        $store2(out.as_mut_ptr().add(i), $mul2($load2(a.as_ptr().add(i)), f));
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *a.get_unchecked(i) * factor;
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(a: &[$ty], out: &mut [$ty], factor: $ty) {
                    let f = $set5(factor);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        $store5(out.as_mut_ptr().add(i), $mul5($load5(a.as_ptr().add(i)), f));
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *a.get_unchecked(i) * factor;
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(a, out, factor) },
                    SimdLevel::Avx2 => return unsafe { avx2(a, out, factor) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for (slot, &x) in out.iter_mut().zip(a) {
                *slot = x * factor;
            }
        }

        pub fn $assign_name(out: &mut [$ty], factor: $ty, level: SimdLevel) {
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2")]
                unsafe fn avx2(out: &mut [$ty], factor: $ty) {
                    let f = $set2(factor);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store2(ptr, $mul2($load2(ptr), f));
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *out.get_unchecked(i) * factor;
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(out: &mut [$ty], factor: $ty) {
                    let f = $set5(factor);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store5(ptr, $mul5($load5(ptr), f));
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = *out.get_unchecked(i) * factor;
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(out, factor) },
                    SimdLevel::Avx2 => return unsafe { avx2(out, factor) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for slot in out.iter_mut() {
                *slot *= factor;
            }
        }
    };
}

scale_kernel!(scale_f32, scale_assign_f32, f32,
    (_mm256_loadu_ps, _mm256_storeu_ps, _mm256_set1_ps, _mm256_mul_ps, 8),
    (_mm512_loadu_ps, _mm512_storeu_ps, _mm512_set1_ps, _mm512_mul_ps, 16));
scale_kernel!(scale_f64, scale_assign_f64, f64,
    (_mm256_loadu_pd, _mm256_storeu_pd, _mm256_set1_pd, _mm256_mul_pd, 4),
    (_mm512_loadu_pd, _mm512_storeu_pd, _mm512_set1_pd, _mm512_mul_pd, 8));

macro_rules! relu_kernel {
    (
        $name:ident, $assign_name:ident, $ty:ty,
        ($load2:ident, $store2:ident, $max2:ident, $zero2:ident, $lanes2:expr),
        ($load5:ident, $store5:ident, $max5:ident, $zero5:ident, $lanes5:expr)
    ) => {
        pub fn $name(a: &[$ty], out: &mut [$ty], level: SimdLevel) {
            debug_assert_eq!(a.len(), out.len());
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2")]
                unsafe fn avx2(a: &[$ty], out: &mut [$ty]) {
                    let zero = $zero2();
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        $store2(out.as_mut_ptr().add(i), $max2($load2(a.as_ptr().add(i)), zero));
                        i += $lanes2;
                    }
                    while i < len {
                        let x = *a.get_unchecked(i);
                        *out.get_unchecked_mut(i) = if x > 0.0 { x } else { 0.0 };
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(a: &[$ty], out: &mut [$ty]) {
                    let zero = $zero5();
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        $store5(out.as_mut_ptr().add(i), $max5($load5(a.as_ptr().add(i)), zero));
                        i += $lanes5;
                    }
                    while i < len {
                        let x = *a.get_unchecked(i);
                        *out.get_unchecked_mut(i) = if x > 0.0 { x } else { 0.0 };
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(a, out) },
                    SimdLevel::Avx2 => return unsafe { avx2(a, out) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for (slot, &x) in out.iter_mut().zip(a) {
                *slot = if x > 0.0 { x } else { 0.0 };
            }
        }

        pub fn $assign_name(out: &mut [$ty], level: SimdLevel) {
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2")]
                unsafe fn avx2(out: &mut [$ty]) {
                    let zero = $zero2();
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store2(ptr, $max2($load2(ptr), zero));
                        i += $lanes2;
                    }
                    while i < len {
                        let x = *out.get_unchecked(i);
                        *out.get_unchecked_mut(i) = if x > 0.0 { x } else { 0.0 };
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(out: &mut [$ty]) {
                    let zero = $zero5();
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store5(ptr, $max5($load5(ptr), zero));
                        i += $lanes5;
                    }
                    while i < len {
                        let x = *out.get_unchecked(i);
                        *out.get_unchecked_mut(i) = if x > 0.0 { x } else { 0.0 };
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(out) },
                    SimdLevel::Avx2 => return unsafe { avx2(out) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for slot in out.iter_mut() {
                if !(*slot > 0.0) {
                    *slot = 0.0;
                }
            }
        }
    };
}

relu_kernel!(relu_f32, relu_assign_f32, f32,
    (_mm256_loadu_ps, _mm256_storeu_ps, _mm256_max_ps, _mm256_setzero_ps, 8),
    (_mm512_loadu_ps, _mm512_storeu_ps, _mm512_max_ps, _mm512_setzero_ps, 16));
relu_kernel!(relu_f64, relu_assign_f64, f64,
    (_mm256_loadu_pd, _mm256_storeu_pd, _mm256_max_pd, _mm256_setzero_pd, 4),
    (_mm512_loadu_pd, _mm512_storeu_pd, _mm512_max_pd, _mm512_setzero_pd, 8));

// Negation flips the sign bit, matching scalar `-x` exactly (including for
// signed zeros). AVX-512F has no float xor, so the 512-bit path bounces
// through the integer domain.

pub fn neg_f32(a: &[f32], out: &mut [f32], level: SimdLevel) {
    debug_assert_eq!(a.len(), out.len());
    #[cfg(target_arch = "x86_64")]
    {
        #[target_feature(enable = "avx2")]
        unsafe fn avx2(a: &[f32], out: &mut [f32]) {
            let sign = _mm256_set1_ps(-0.0);
            let len = out.len();
            let mut i = 0;
            while i + 8 <= len {
                _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_xor_ps(_mm256_loadu_ps(a.as_ptr().add(i)), sign));
                i += 8;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*a.get_unchecked(i);
                i += 1;
            }
        }

        #[target_feature(enable = "avx512f")]
        unsafe fn avx512(a: &[f32], out: &mut [f32]) {
            let sign = _mm512_set1_epi32(i32::MIN);
            let len = out.len();
            let mut i = 0;
            while i + 16 <= len {
                let v = _mm512_castps_si512(_mm512_loadu_ps(a.as_ptr().add(i)));
                _mm512_storeu_ps(out.as_mut_ptr().add(i), _mm512_castsi512_ps(_mm512_xor_si512(v, sign)));
                i += 16;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*a.get_unchecked(i);
                i += 1;
            }
        }

        match level {
            SimdLevel::Avx512 => return unsafe { avx512(a, out) },
            SimdLevel::Avx2 => return unsafe { avx2(a, out) },
            SimdLevel::Scalar => {}
        }
    }
    let _ = level;
    for (slot, &x) in out.iter_mut().zip(a) {
        *slot = -x;
    }
}

pub fn neg_assign_f32(out: &mut [f32], level: SimdLevel) {
    #[cfg(target_arch = "x86_64")]
    {
        #[target_feature(enable = "avx2")]
        unsafe fn avx2(out: &mut [f32]) {
            let sign = _mm256_set1_ps(-0.0);
            let len = out.len();
            let mut i = 0;
            while i + 8 <= len {
                let ptr = out.as_mut_ptr().add(i);
                _mm256_storeu_ps(ptr, _mm256_xor_ps(_mm256_loadu_ps(ptr), sign));
                i += 8;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*out.get_unchecked(i);
                i += 1;
            }
        }

        #[target_feature(enable = "avx512f")]
        unsafe fn avx512(out: &mut [f32]) {
            let sign = _mm512_set1_epi32(i32::MIN);
            let len = out.len();
            let mut i = 0;
            while i + 16 <= len {
                let ptr = out.as_mut_ptr().add(i);
                let v = _mm512_castps_si512(_mm512_loadu_ps(ptr));
                _mm512_storeu_ps(ptr, _mm512_castsi512_ps(_mm512_xor_si512(v, sign)));
                i += 16;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*out.get_unchecked(i);
                i += 1;
            }
        }

        match level {
            SimdLevel::Avx512 => return unsafe { avx512(out) },
            SimdLevel::Avx2 => return unsafe { avx2(out) },
            SimdLevel::Scalar => {}
        }
    }
    let _ = level;
    for slot in out.iter_mut() {
        *slot = -*slot;
    }
}

pub fn neg_f64(a: &[f64], out: &mut [f64], level: SimdLevel) {
    debug_assert_eq!(a.len(), out.len());
    #[cfg(target_arch = "x86_64")]
    {
        #[target_feature(enable = "avx2")]
        unsafe fn avx2(a: &[f64], out: &mut [f64]) {
            let sign = _mm256_set1_pd(-0.0);
            let len = out.len();
            let mut i = 0;
            while i + 4 <= len {
                _mm256_storeu_pd(out.as_mut_ptr().add(i), _mm256_xor_pd(_mm256_loadu_pd(a.as_ptr().add(i)), sign));
                i += 4;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*a.get_unchecked(i);
                i += 1;
            }
        }

        #[target_feature(enable = "avx512f")]
        unsafe fn avx512(a: &[f64], out: &mut [f64]) {
            let sign = _mm512_set1_epi64(i64::MIN);
            let len = out.len();
            let mut i = 0;
            while i + 8 <= len {
                let v = _mm512_castpd_si512(_mm512_loadu_pd(a.as_ptr().add(i)));
                _mm512_storeu_pd(out.as_mut_ptr().add(i), _mm512_castsi512_pd(_mm512_xor_si512(v, sign)));
                i += 8;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*a.get_unchecked(i);
                i += 1;
            }
        }

        match level {
            SimdLevel::Avx512 => return unsafe { avx512(a, out) },
            SimdLevel::Avx2 => return unsafe { avx2(a, out) },
            SimdLevel::Scalar => {}
        }
    }
    let _ = level;
    for (slot, &x) in out.iter_mut().zip(a) {
        *slot = -x;
    }
}

pub fn neg_assign_f64(out: &mut [f64], level: SimdLevel) {
    #[cfg(target_arch = "x86_64")]
    {
        #[target_feature(enable = "avx2")]
        unsafe fn avx2(out: &mut [f64]) {
            let sign = _mm256_set1_pd(-0.0);
            let len = out.len();
            let mut i = 0;
            while i + 4 <= len {
                let ptr = out.as_mut_ptr().add(i);
                _mm256_storeu_pd(ptr, _mm256_xor_pd(_mm256_loadu_pd(ptr), sign));
                i += 4;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*out.get_unchecked(i);
                i += 1;
            }
        }

        #[target_feature(enable = "avx512f")]
        unsafe fn avx512(out: &mut [f64]) {
            let sign = _mm512_set1_epi64(i64::MIN);
            let len = out.len();
            let mut i = 0;
            while i + 8 <= len {
                let ptr = out.as_mut_ptr().add(i);
                let v = _mm512_castpd_si512(_mm512_loadu_pd(ptr));
                _mm512_storeu_pd(ptr, _mm512_castsi512_pd(_mm512_xor_si512(v, sign)));
                i += 8;
            }
            while i < len {
                *out.get_unchecked_mut(i) = -*out.get_unchecked(i);
                i += 1;
            }
        }

        match level {
            SimdLevel::Avx512 => return unsafe { avx512(out) },
            SimdLevel::Avx2 => return unsafe { avx2(out) },
            SimdLevel::Scalar => {}
        }
    }
    let _ = level;
    for slot in out.iter_mut() {
        *slot = -*slot;
    }
}

// The affine family is the batch-normalization workhorse: one broadcast
// scale and shift applied over a channel plane, optionally clamped at zero
// for the fused conv+bn+relu epilogue.

macro_rules! affine_kernel {
    (
        $name:ident, $assign_name:ident, $relu_assign_name:ident, $ty:ty,
        ($load2:ident, $store2:ident, $set2:ident, $fmadd2:ident, $max2:ident, $zero2:ident, $lanes2:expr),
        ($load5:ident, $store5:ident, $set5:ident, $fmadd5:ident, $max5:ident, $zero5:ident, $lanes5:expr)
    ) => {
        /// `out = a * scale + shift`.
        pub fn $name(a: &[$ty], out: &mut [$ty], scale: $ty, shift: $ty, level: SimdLevel) {
            debug_assert_eq!(a.len(), out.len());
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2,fma")]
                unsafe fn avx2(a: &[$ty], out: &mut [$ty], scale: $ty, shift: $ty) {
                    let s = $set2(scale);
                    let t = $set2(shift);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        $store2(out.as_mut_ptr().add(i), $fmadd2($load2(a.as_ptr().add(i)), s, t));
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = a.get_unchecked(i).mul_add(scale, shift);
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(a: &[$ty], out: &mut [$ty], scale: $ty, shift: $ty) {
                    let s = $set5(scale);
                    let t = $set5(shift);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        $store5(out.as_mut_ptr().add(i), $fmadd5($load5(a.as_ptr().add(i)), s, t));
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = a.get_unchecked(i).mul_add(scale, shift);
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(a, out, scale, shift) },
                    SimdLevel::Avx2 => return unsafe { avx2(a, out, scale, shift) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for (slot, &x) in out.iter_mut().zip(a) {
                *slot = x.mul_add(scale, shift);
            }
        }

        /// `out = out * scale + shift`.
        pub fn $assign_name(out: &mut [$ty], scale: $ty, shift: $ty, level: SimdLevel) {
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2,fma")]
                unsafe fn avx2(out: &mut [$ty], scale: $ty, shift: $ty) {
                    let s = $set2(scale);
                    let t = $set2(shift);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store2(ptr, $fmadd2($load2(ptr), s, t));
                        i += $lanes2;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = out.get_unchecked(i).mul_add(scale, shift);
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(out: &mut [$ty], scale: $ty, shift: $ty) {
                    let s = $set5(scale);
                    let t = $set5(shift);
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store5(ptr, $fmadd5($load5(ptr), s, t));
                        i += $lanes5;
                    }
                    while i < len {
                        *out.get_unchecked_mut(i) = out.get_unchecked(i).mul_add(scale, shift);
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(out, scale, shift) },
                    SimdLevel::Avx2 => return unsafe { avx2(out, scale, shift) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for slot in out.iter_mut() {
                *slot = slot.mul_add(scale, shift);
            }
        }

        /// `out = max(out * scale + shift, 0)`.
        pub fn $relu_assign_name(out: &mut [$ty], scale: $ty, shift: $ty, level: SimdLevel) {
            #[cfg(target_arch = "x86_64")]
            {
                #[target_feature(enable = "avx2,fma")]
                unsafe fn avx2(out: &mut [$ty], scale: $ty, shift: $ty) {
                    let s = $set2(scale);
                    let t = $set2(shift);
                    let zero = $zero2();
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes2 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store2(ptr, $max2($fmadd2($load2(ptr), s, t), zero));
                        i += $lanes2;
                    }
                    while i < len {
                        let y = out.get_unchecked(i).mul_add(scale, shift);
                        *out.get_unchecked_mut(i) = if y > 0.0 { y } else { 0.0 };
                        i += 1;
                    }
                }

                #[target_feature(enable = "avx512f")]
                unsafe fn avx512(out: &mut [$ty], scale: $ty, shift: $ty) {
                    let s = $set5(scale);
                    let t = $set5(shift);
                    let zero = $zero5();
                    let len = out.len();
                    let mut i = 0;
                    while i + $lanes5 <= len {
                        let ptr = out.as_mut_ptr().add(i);
                        $store5(ptr, $max5($fmadd5($load5(ptr), s, t), zero));
                        i += $lanes5;
                    }
                    while i < len {
                        let y = out.get_unchecked(i).mul_add(scale, shift);
                        *out.get_unchecked_mut(i) = if y > 0.0 { y } else { 0.0 };
                        i += 1;
                    }
                }

                match level {
                    SimdLevel::Avx512 => return unsafe { avx512(out, scale, shift) },
                    SimdLevel::Avx2 => return unsafe { avx2(out, scale, shift) },
                    SimdLevel::Scalar => {}
                }
            }
            let _ = level;
            for slot in out.iter_mut() {
                let y = slot.mul_add(scale, shift);
                *slot = if y > 0.0 { y } else { 0.0 };
            }
        }
    };
}

affine_kernel!(affine_f32, affine_assign_f32, affine_relu_assign_f32, f32,
    (_mm256_loadu_ps, _mm256_storeu_ps, _mm256_set1_ps, _mm256_fmadd_ps, _mm256_max_ps, _mm256_setzero_ps, 8),
    (_mm512_loadu_ps, _mm512_storeu_ps, _mm512_set1_ps, _mm512_fmadd_ps, _mm512_max_ps, _mm512_setzero_ps, 16));
affine_kernel!(affine_f64, affine_assign_f64, affine_relu_assign_f64, f64,
    (_mm256_loadu_pd, _mm256_storeu_pd, _mm256_set1_pd, _mm256_fmadd_pd, _mm256_max_pd, _mm256_setzero_pd, 4),
    (_mm512_loadu_pd, _mm512_storeu_pd, _mm512_set1_pd, _mm512_fmadd_pd, _mm512_max_pd, _mm512_setzero_pd, 8));

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 37) % 19) as f32 - 9.0).collect()
    }

    #[test]
    fn vector_add_matches_scalar_bitwise() {
        let level = SimdLevel::detect();
        let a = samples(131);
        let b: Vec<f32> = samples(131).iter().map(|x| x * 0.5 + 0.25).collect();
        let mut fast = vec![0.0f32; 131];
        let mut slow = vec![0.0f32; 131];
        add_f32(&a, &b, &mut fast, level);
        add_f32(&a, &b, &mut slow, SimdLevel::Scalar);
        assert_eq!(fast, slow);
    }

    #[test]
    fn fma_contracts_identically_on_both_tiers() {
        let level = SimdLevel::detect();
        let a = samples(67);
        let b: Vec<f32> = samples(67).iter().map(|x| x * 0.3).collect();
        let c: Vec<f32> = samples(67).iter().map(|x| x - 1.5).collect();
        let mut fast = vec![0.0f32; 67];
        let mut slow = vec![0.0f32; 67];
        fma_f32(&a, &b, &c, &mut fast, level);
        fma_f32(&a, &b, &c, &mut slow, SimdLevel::Scalar);
        assert_eq!(fast, slow);
    }

    #[test]
    fn relu_clamps_negatives() {
        let a = [-2.0f32, -0.0, 0.0, 3.5];
        let mut out = [0.0f32; 4];
        relu_f32(&a, &mut out, SimdLevel::detect());
        assert_eq!(out, [0.0, 0.0, 0.0, 3.5]);
    }

    #[test]
    fn assign_variants_match_fresh_kernels() {
        let level = SimdLevel::detect();
        let a = samples(40);
        let b: Vec<f32> = samples(40).iter().map(|x| x + 2.0).collect();
        let mut fresh = vec![0.0f32; 40];
        mul_f32(&a, &b, &mut fresh, level);
        let mut inplace = a.clone();
        mul_assign_f32(&mut inplace, &b, level);
        assert_eq!(fresh, inplace);

        let mut fresh = vec![0.0f32; 40];
        affine_f32(&a, &mut fresh, 1.25, -0.5, level);
        let mut inplace = a.clone();
        affine_assign_f32(&mut inplace, 1.25, -0.5, level);
        assert_eq!(fresh, inplace);
    }

    #[test]
    fn neg_flips_sign_bit_exactly() {
        let a = [0.0f32, -0.0, 1.5, -2.25];
        let mut out = [0.0f32; 4];
        neg_f32(&a, &mut out, SimdLevel::detect());
        assert_eq!(out[0].to_bits(), (-0.0f32).to_bits());
        assert_eq!(out[1].to_bits(), 0.0f32.to_bits());
        assert_eq!(&out[2..], &[-1.5, 2.25]);
    }
}
