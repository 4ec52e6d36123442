//! The erasure-coding step a peer applies to what it receives.
use std::thread;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::Error;

/// Expands `columns` stripes of `input` into `rows` fragments.
///
/// Fragment `i` is written to `fragments[i][..input.len() / columns]`; trailing input bytes
/// that do not fill a whole stripe are ignored. `parallelism` is a hint for how many threads
/// to use.
pub trait Encode: Send + Sync {
    fn encode(
        &self,
        input: &[u8],
        columns: usize,
        rows: usize,
        fragments: &mut [&mut [u8]],
        parallelism: usize,
    );
}

/// Systematic Reed-Solomon over GF(2^8): the first `columns` fragments are the input stripes,
/// the remaining `rows - columns` are parity.
pub struct ReedSolomonEncoder {
    rs: Option<ReedSolomon>,
    columns: usize,
    rows: usize,
}

impl ReedSolomonEncoder {
    pub fn new(columns: usize, rows: usize) -> Result<Self, Error> {
        if columns == 0 || rows < columns {
            return Err(Error::Config(format!(
                "cannot encode {} columns into {} rows",
                columns, rows
            )));
        }
        let rs = if rows > columns {
            let rs = ReedSolomon::new(columns, rows - columns).map_err(|e| {
                Error::Config(format!("Failed to create Reed-Solomon codec: {:?}", e))
            })?;
            Some(rs)
        } else {
            None
        };
        Ok(ReedSolomonEncoder { rs, columns, rows })
    }
}

impl Encode for ReedSolomonEncoder {
    fn encode(
        &self,
        input: &[u8],
        columns: usize,
        rows: usize,
        fragments: &mut [&mut [u8]],
        parallelism: usize,
    ) {
        assert_eq!(
            (columns, rows),
            (self.columns, self.rows),
            "encoder built for another shape"
        );
        assert_eq!(fragments.len(), rows);
        let stripe = input.len() / columns;

        let (data, parity) = fragments.split_at_mut(columns);
        for (i, fragment) in data.iter_mut().enumerate() {
            fragment[..stripe].copy_from_slice(&input[i * stripe..(i + 1) * stripe]);
        }
        let Some(rs) = self.rs.as_ref() else {
            return;
        };
        if stripe == 0 {
            return;
        }

        // every thread encodes the same byte range of all stripes
        let chunk = (stripe + parallelism.max(1) - 1) / parallelism.max(1);
        let mut jobs: Vec<Vec<&mut [u8]>> = (0..(stripe + chunk - 1) / chunk)
            .map(|_| Vec::with_capacity(parity.len()))
            .collect();
        for fragment in parity.iter_mut() {
            for (job, part) in jobs.iter_mut().zip(fragment[..stripe].chunks_mut(chunk)) {
                job.push(part);
            }
        }

        thread::scope(|s| {
            for (i, mut parity) in jobs.into_iter().enumerate() {
                let lo = i * chunk;
                let hi = (lo + chunk).min(stripe);
                let data: Vec<&[u8]> = (0..columns)
                    .map(|c| &input[c * stripe + lo..c * stripe + hi])
                    .collect();
                s.spawn(move || {
                    if let Err(e) = rs.encode_sep(&data, &mut parity) {
                        log::error!("encoding bytes {}..{} failed: {:?}", lo, hi, e);
                    }
                });
            }
        });
    }
}
