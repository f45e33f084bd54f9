//! Padding masks and monotonic text-to-frame alignment.
//!
//! The monotonic path is extracted on the host with the usual
//! dynamic-programming recurrence: each frame is assigned to exactly one
//! phoneme, the phoneme index never decreases, and the path starts at the
//! first phoneme and ends at the last valid one.

use mlx_rs::Array;

use crate::{Result, TrainerError};

/// Float mask `[B, max_len]` with `1.0` at padded positions.
pub fn length_to_mask(lengths: &[i32], max_len: i32) -> Array {
    let batch = lengths.len() as i32;
    let mut data = Vec::with_capacity((batch * max_len.max(0)) as usize);
    for &len in lengths {
        for t in 0..max_len {
            data.push(if t >= len { 1.0f32 } else { 0.0 });
        }
    }
    Array::from_slice(&data, &[batch, max_len])
}

/// Float mask `[B, max_len]` with `1.0` at valid positions.
pub fn valid_mask(lengths: &[i32], max_len: i32) -> Array {
    let batch = lengths.len() as i32;
    let mut data = Vec::with_capacity((batch * max_len.max(0)) as usize);
    for &len in lengths {
        for t in 0..max_len {
            data.push(if t < len { 1.0f32 } else { 0.0 });
        }
    }
    Array::from_slice(&data, &[batch, max_len])
}

/// Joint validity mask `[B, rows, cols]`: `1.0` where both the text row and
/// the frame column are inside the utterance.
pub fn mask_from_lens(
    text_lengths: &[i32],
    frame_lengths: &[i32],
    rows: i32,
    cols: i32,
) -> Array {
    let batch = text_lengths.len() as i32;
    let mut data = Vec::with_capacity((batch * rows * cols).max(0) as usize);
    for (&tl, &fl) in text_lengths.iter().zip(frame_lengths) {
        for r in 0..rows {
            for c in 0..cols {
                data.push(if r < tl && c < fl { 1.0f32 } else { 0.0 });
            }
        }
    }
    Array::from_slice(&data, &[batch, rows, cols])
}

/// Frame lengths after the aligner's stride of `2^n_down`.
pub fn downsampled_lengths(mel_lengths: &[i32], n_down: u32) -> Vec<i32> {
    let stride = 1i32 << n_down;
    mel_lengths.iter().map(|&l| l / stride).collect()
}

/// Monotonic path for one utterance.
///
/// `scores` is row-major `[rows, cols]`; only the top-left
/// `text_len × frame_len` block is considered. Returns a `[rows, cols]`
/// 0/1 matrix. Requires `frame_len >= text_len >= 1`.
pub fn monotonic_path(
    scores: &[f32],
    rows: usize,
    cols: usize,
    text_len: usize,
    frame_len: usize,
) -> Vec<f32> {
    let mut path = vec![0.0f32; rows * cols];
    if text_len == 0 || frame_len < text_len {
        return path;
    }

    let neg = f32::NEG_INFINITY;
    let mut value = vec![0.0f32; text_len * frame_len];
    for x in 0..text_len {
        for y in 0..frame_len {
            value[x * frame_len + y] = scores[x * cols + y];
        }
    }

    for y in 0..frame_len {
        let lo = (text_len + y).saturating_sub(frame_len);
        let hi = text_len.min(y + 1);
        for x in lo..hi {
            let stay = if x == y { neg } else { value[x * frame_len + y - 1] };
            let advance = match (x, y) {
                (0, 0) => 0.0,
                (0, _) => neg,
                _ => value[(x - 1) * frame_len + y - 1],
            };
            value[x * frame_len + y] += stay.max(advance);
        }
    }

    let mut index = text_len - 1;
    for y in (0..frame_len).rev() {
        path[index * cols + y] = 1.0;
        if index != 0
            && (index == y
                || value[index * frame_len + y - 1] < value[(index - 1) * frame_len + y - 1])
        {
            index -= 1;
        }
    }
    path
}

/// Batched monotonic path over `[B, rows, cols]` scores.
///
/// Every utterance must satisfy `frame_len >= text_len >= 1`; callers check
/// this before and skip the batch otherwise.
pub fn maximum_path(
    attn: &Array,
    text_lengths: &[i32],
    frame_lengths: &[i32],
) -> Result<Array> {
    let shape = attn.shape().to_vec();
    if shape.len() != 3 || shape[0] as usize != text_lengths.len() {
        return Err(TrainerError::contract(
            "alignment",
            format!("expected [B, rows, cols] attention, got {shape:?}"),
        ));
    }
    let (batch, rows, cols) = (shape[0] as usize, shape[1] as usize, shape[2] as usize);

    let host = mlx_rs::stop_gradient(attn)?.as_dtype(mlx_rs::Dtype::Float32)?;
    host.eval()?;
    let values = host.as_slice::<f32>();

    let mut out = Vec::with_capacity(batch * rows * cols);
    for b in 0..batch {
        let text_len = (text_lengths[b].max(0) as usize).min(rows);
        let frame_len = (frame_lengths[b].max(0) as usize).min(cols);
        if text_len == 0 || frame_len < text_len {
            return Err(TrainerError::contract(
                "alignment",
                format!("utterance {b}: {frame_len} frames for {text_len} tokens"),
            ));
        }
        let block = &values[b * rows * cols..(b + 1) * rows * cols];
        out.extend(monotonic_path(block, rows, cols, text_len, frame_len));
    }
    Ok(Array::from_slice(&out, &shape))
}

/// Frames per phoneme of a `[B, rows, cols]` path, as host integers.
pub fn durations(path: &Array) -> Result<Vec<Vec<i32>>> {
    let shape = path.shape();
    let (batch, rows) = (shape[0] as usize, shape[1] as usize);
    let counts = path.sum_axis(-1, None)?;
    counts.eval()?;
    let counts = counts.as_slice::<f32>();
    Ok((0..batch)
        .map(|b| {
            counts[b * rows..(b + 1) * rows]
                .iter()
                .map(|&c| c.round() as i32)
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_monotonic(path: &[f32], rows: usize, cols: usize, text_len: usize, frame_len: usize) {
        let mut previous = 0usize;
        let mut per_row = vec![0usize; rows];
        for y in 0..frame_len {
            let assigned: Vec<usize> = (0..rows).filter(|&x| path[x * cols + y] > 0.5).collect();
            assert_eq!(assigned.len(), 1, "frame {y} assigned to {assigned:?}");
            let row = assigned[0];
            assert!(row >= previous, "path moved backward at frame {y}");
            assert!(row < text_len);
            previous = row;
            per_row[row] += 1;
        }
        for y in frame_len..cols {
            assert!((0..rows).all(|x| path[x * cols + y] == 0.0));
        }
        assert_eq!(per_row.iter().sum::<usize>(), frame_len);
        assert!(per_row[..text_len].iter().all(|&c| c >= 1));
    }

    #[test]
    fn test_masks() {
        let mask = length_to_mask(&[2, 3], 3);
        mask.eval().unwrap();
        assert_eq!(mask.as_slice::<f32>(), &[0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        let valid = valid_mask(&[1], 2);
        valid.eval().unwrap();
        assert_eq!(valid.as_slice::<f32>(), &[1.0, 0.0]);
        assert_eq!(downsampled_lengths(&[17, 8], 1), vec![8, 4]);
    }

    #[test]
    fn test_path_follows_strong_diagonal() {
        // 3 tokens, 6 frames; token i dominates frames 2i, 2i+1
        let (rows, cols) = (3, 6);
        let mut scores = vec![0.01f32; rows * cols];
        for x in 0..rows {
            scores[x * cols + 2 * x] = 1.0;
            scores[x * cols + 2 * x + 1] = 1.0;
        }
        let path = monotonic_path(&scores, rows, cols, 3, 6);
        check_monotonic(&path, rows, cols, 3, 6);
        for x in 0..rows {
            assert_eq!(path[x * cols + 2 * x], 1.0);
            assert_eq!(path[x * cols + 2 * x + 1], 1.0);
        }
    }

    #[test]
    fn test_batched_path_is_valid_with_padding() {
        let (batch, rows, cols) = (3usize, 4usize, 9usize);
        let scores: Vec<f32> = (0..batch * rows * cols)
            .map(|i| ((i * 7919) % 97) as f32 / 97.0)
            .collect();
        let attn = Array::from_slice(&scores, &[batch as i32, rows as i32, cols as i32]);
        let text_lengths = [4, 2, 3];
        let frame_lengths = [9, 5, 3];
        let path = maximum_path(&attn, &text_lengths, &frame_lengths).unwrap();
        path.eval().unwrap();
        let values = path.as_slice::<f32>();
        for b in 0..batch {
            let block = &values[b * rows * cols..(b + 1) * rows * cols];
            check_monotonic(
                block,
                rows,
                cols,
                text_lengths[b] as usize,
                frame_lengths[b] as usize,
            );
        }

        let d = durations(&path).unwrap();
        for b in 0..batch {
            assert_eq!(d[b].iter().sum::<i32>(), frame_lengths[b]);
        }
    }

    #[test]
    fn test_fewer_frames_than_tokens_is_rejected() {
        let attn = mlx_rs::ops::ones::<f32>(&[1, 4, 3]).unwrap();
        assert!(maximum_path(&attn, &[4], &[3]).is_err());
    }

    #[test]
    fn test_joint_mask() {
        let mask = mask_from_lens(&[1], &[2], 2, 3);
        mask.eval().unwrap();
        assert_eq!(mask.as_slice::<f32>(), &[1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }
}
