//! KV cache layout conversion for the attention units
//!
//! The cache is time-major, `[t][kv_dim]`. An attention unit wants one
//! head's keys as `[t][o]` and its values as `[o][t]`, so the host regroups
//! the cache by key/value head before distributing it.

/// Shape of one layer of the KV cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub kv_dim: usize,
    pub head_size: usize,
    pub n_kv_heads: usize,
}

/// Keys as `[kv_head][t][o]` for the first `len` positions
pub fn transpose_keys(keys: &[f32], layout: CacheLayout, len: usize) -> Vec<f32> {
    let hs = layout.head_size;
    let mut out = vec![0.0; layout.n_kv_heads * len * hs];
    for h in 0..layout.n_kv_heads {
        for t in 0..len {
            let src = t * layout.kv_dim + h * hs;
            let dst = (h * len + t) * hs;
            out[dst..dst + hs].copy_from_slice(&keys[src..src + hs]);
        }
    }
    out
}

/// Values as `[kv_head][o][t]` for the first `len` positions
///
/// Rows are `stride` long so each head's block matches the unit's value
/// symbol; entries from `len` to `stride` stay zero.
pub fn transpose_values(values: &[f32], layout: CacheLayout, len: usize, stride: usize) -> Vec<f32> {
    let hs = layout.head_size;
    let mut out = vec![0.0; layout.n_kv_heads * hs * stride];
    for h in 0..layout.n_kv_heads {
        for t in 0..len {
            let src = t * layout.kv_dim + h * hs;
            for o in 0..hs {
                out[(h * hs + o) * stride + t] = values[src + o];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // kv_dim 4 = 2 heads of size 2; value at (t, h, o) = 100t + 10h + o
    fn cache(len: usize) -> Vec<f32> {
        let mut rows = Vec::new();
        for t in 0..len {
            for h in 0..2 {
                for o in 0..2 {
                    rows.push((100 * t + 10 * h + o) as f32);
                }
            }
        }
        rows
    }

    const LAYOUT: CacheLayout = CacheLayout {
        kv_dim: 4,
        head_size: 2,
        n_kv_heads: 2,
    };

    #[test]
    fn test_keys_time_major_per_head() {
        let keys = transpose_keys(&cache(3), LAYOUT, 3);
        assert_eq!(
            keys,
            vec![0.0, 1.0, 100.0, 101.0, 200.0, 201.0, 10.0, 11.0, 110.0, 111.0, 210.0, 211.0]
        );
    }

    #[test]
    fn test_values_dimension_major_per_head() {
        let values = transpose_values(&cache(2), LAYOUT, 2, 3);
        assert_eq!(
            values,
            vec![
                0.0, 100.0, 0.0, // h0 o0
                1.0, 101.0, 0.0, // h0 o1
                10.0, 110.0, 0.0, // h1 o0
                11.0, 111.0, 0.0, // h1 o1
            ]
        );
    }
}
