//! Benchmark of the monotonic alignment search.
//!
//! Run with: cargo bench --bench monotonic_path

use std::time::Instant;

use mlx_rs::{transforms::eval, Array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stylus_trainer::alignment::{maximum_path, monotonic_path};

fn main() {
    let mut rng = StdRng::seed_from_u64(0);

    // Single utterance, host only
    for &(tokens, frames) in &[(40usize, 200usize), (120, 600), (200, 1000)] {
        let scores: Vec<f32> = (0..tokens * frames).map(|_| rng.gen::<f32>()).collect();
        let n_iters = 50;

        let start = Instant::now();
        for _ in 0..n_iters {
            let path = monotonic_path(&scores, tokens, frames, tokens, frames);
            assert_eq!(path.iter().sum::<f32>() as usize, frames);
        }
        let elapsed = start.elapsed();
        let per_op_us = elapsed.as_micros() as f64 / n_iters as f64;
        println!(
            "monotonic_path [{} x {}]: {:.1} us per utterance",
            tokens, frames, per_op_us
        );
    }

    // Batched, including the device round trip
    let (batch, rows, cols) = (16i32, 80i32, 400i32);
    let data: Vec<f32> = (0..batch * rows * cols).map(|_| rng.gen::<f32>()).collect();
    let attn = Array::from_slice(&data, &[batch, rows, cols]);
    eval(&[&attn]).unwrap();
    let text_lengths: Vec<i32> = (0..batch).map(|_| rng.gen_range(rows / 2..=rows)).collect();
    let frame_lengths: Vec<i32> = (0..batch).map(|_| rng.gen_range(cols / 2..=cols)).collect();

    let n_iters = 20;
    let start = Instant::now();
    for _ in 0..n_iters {
        let path = maximum_path(&attn, &text_lengths, &frame_lengths).unwrap();
        eval(&[&path]).unwrap();
    }
    let elapsed = start.elapsed();
    let per_op_ms = elapsed.as_micros() as f64 / n_iters as f64 / 1000.0;

    println!("\nmaximum_path [{} x {} x {}]", batch, rows, cols);
    println!("Total time: {:?}", elapsed);
    println!("Per batch: {:.3} ms", per_op_ms);
}
