//! Toy dataset generation.

use cf_core::Result;
use cf_pdf::{Dataset, Pdf};
use rand::SeedableRng;

/// Draw `n` entries from `model`. Sampling is deterministic for a given `seed`.
pub fn generate_dataset<P: Pdf + ?Sized>(model: &P, n: usize, seed: u64) -> Result<Dataset> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let rows = (0..n).map(|_| model.generate(&mut rng)).collect::<Result<Vec<_>>>()?;
    Dataset::from_rows(&rows)
}

/// Generate `n_toys` datasets; toy `i` uses seed `seed + i`.
pub fn generate_toys<P: Pdf + ?Sized>(
    model: &P,
    n_entries: usize,
    n_toys: usize,
    seed: u64,
) -> Result<Vec<Dataset>> {
    (0..n_toys)
        .map(|i| generate_dataset(model, n_entries, seed.wrapping_add(i as u64)))
        .collect()
}
