//! Mask and position helpers shared by the encoder and decoder stacks.
//!
//! Polarity is always stated in the name: decoder masks here are
//! *allowed* masks (true = may attend). The encoder's blocked-pair mask is
//! produced outside this crate and handed to [`AttentionMask::blocked_pairs`].
//!
//! [`AttentionMask::blocked_pairs`]: super::attention::AttentionMask::blocked_pairs

use burn::prelude::*;

/// Lower-triangular causal mask, true on and below the diagonal.
///
/// Returns: [batch, len, len]
pub fn causal_mask<B: Backend>(
    batch_size: usize,
    len: usize,
    device: &B::Device,
) -> Tensor<B, 3, Bool> {
    let ones = Tensor::<B, 2>::ones([len, len], device);
    let lower: Tensor<B, 2, Bool> = ones.tril(0).greater_elem(0.5);
    lower
        .unsqueeze_dim::<3>(0)
        .expand([batch_size, len, len])
}

/// Combine relation validity (`id != pad_index`) with a causal mask.
///
/// A query row whose relations are all padding inside its causal window
/// falls back to the causal window itself, so every row keeps at least its
/// own history. With all-padding ids this reduces to `causal`.
///
/// - `rel_ids`: [batch, len, len]
/// - `causal`: [batch, len, len], true = allowed
pub fn relation_mask<B: Backend>(
    rel_ids: Tensor<B, 3, Int>,
    pad_index: usize,
    causal: Tensor<B, 3, Bool>,
) -> Tensor<B, 3, Bool> {
    let [batch, rows, cols] = rel_ids.dims();
    let valid = rel_ids
        .not_equal_elem(pad_index as i64)
        .bool_and(causal.clone());

    // [batch, rows, 1]: does the row keep any key at all?
    let has_key = valid.clone().int().sum_dim(2).greater_elem(0);
    let fallback = has_key
        .bool_not()
        .expand([batch, rows, cols])
        .bool_and(causal);

    (valid.int() + fallback.int()).greater_elem(0)
}

/// Padding mask from sequence lengths, true = real position.
///
/// `max_len` defaults to the longest length.
pub fn lengths_to_mask<B: Backend>(
    lengths: &[usize],
    max_len: Option<usize>,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let max_len = max_len.unwrap_or_else(|| lengths.iter().copied().max().unwrap_or(0));
    let data: Vec<bool> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |i| i < len))
        .collect();
    Tensor::from_data(TensorData::new(data, [lengths.len(), max_len]), device)
}

/// Relative distances for decoder positions, clamped at `clamp`.
///
/// Row `i` is `[i+1, i, ..., 1, 0, ..., 0]`: the distance back to each
/// earlier position (1 = itself), zero for future positions.
pub fn relative_positions<B: Backend>(
    len: usize,
    clamp: usize,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let mut data = Vec::with_capacity(len * len);
    for i in 0..len {
        for j in 0..len {
            let distance = if j <= i { i + 1 - j } else { 0 };
            data.push(distance.min(clamp) as i64);
        }
    }
    Tensor::from_data(TensorData::new(data, [len, len]), device)
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn bools<const D: usize>(t: Tensor<B, D, Bool>) -> Vec<bool> {
        t.into_data().to_vec::<bool>().unwrap()
    }

    #[test]
    fn causal_mask_is_lower_triangular() {
        let device = Default::default();
        let mask = causal_mask::<B>(2, 3, &device);
        assert_eq!(mask.dims(), [2, 3, 3]);
        let expected = [true, false, false, true, true, false, true, true, true];
        let data = bools(mask);
        assert_eq!(&data[..9], &expected);
        assert_eq!(&data[9..], &expected);
    }

    #[test]
    fn relation_mask_blocks_padding_and_future() {
        let device = Default::default();
        // pad = 0; row 1 has a padded pair at (1, 0), row 2 keeps (2, 0) and (2, 2).
        let ids = Tensor::<B, 3, Int>::from_data(
            TensorData::new(vec![3i64, 5, 5, 0, 4, 4, 2, 0, 1], [1, 3, 3]),
            &device,
        );
        let mask = relation_mask(ids, 0, causal_mask::<B>(1, 3, &device));
        assert_eq!(
            bools(mask),
            vec![true, false, false, false, true, false, true, false, true]
        );
    }

    #[test]
    fn all_padding_relations_fall_back_to_causal() {
        let device = Default::default();
        let ids = Tensor::<B, 3, Int>::zeros([2, 4, 4], &device);
        let causal = causal_mask::<B>(2, 4, &device);
        let mask = relation_mask(ids, 0, causal.clone());
        assert_eq!(bools(mask), bools(causal));
    }

    #[test]
    fn lengths_to_mask_marks_real_positions() {
        let device = Default::default();
        let mask = lengths_to_mask::<B>(&[2, 0, 3], None, &device);
        assert_eq!(mask.dims(), [3, 3]);
        assert_eq!(
            bools(mask),
            vec![true, true, false, false, false, false, true, true, true]
        );
    }

    #[test]
    fn relative_positions_clamp() {
        let device = Default::default();
        let rel = relative_positions::<B>(4, 3, &device);
        let data = rel.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        let rendered = data
            .chunks(4)
            .map(|row| {
                row.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n");
        insta::assert_snapshot!(rendered, @r"
        1 0 0 0
        2 1 0 0
        3 2 1 0
        3 3 2 1
        ");
    }
}
