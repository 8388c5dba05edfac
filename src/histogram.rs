//! Histogram engine for the live display.
//!
//! Two histograms feed the display:
//!
//! - [`Histogram`]: fixed range and bin count, used for the ADC (peak amplitude)
//!   spectrum.
//! - [`TimeHistogram`]: one-second bins whose domain grows as new timestamps arrive.
//!   Growth happens in chunks so appending a new second does not reallocate.
//!
//! Both are plain data structures. Counts only ever increase.

use crate::error::{AppResult, DaqError};
use std::iter;

/// Equal-width histogram over a fixed `[min, max]` range.
///
/// Binning follows the usual equal-width policy: every bin is half-open except
/// the last, which also takes values equal to `max`. Values outside the range
/// and NaN are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    min: f64,
    max: f64,
    counts: Vec<u64>,
    edges: Vec<f64>,
}

impl Histogram {
    /// Create an empty histogram with `bins` equal-width bins over `[min, max]`.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Configuration`] if `bins` is zero, a bound is not finite,
    /// or `max <= min`.
    pub fn new(min: f64, max: f64, bins: usize) -> AppResult<Self> {
        if bins == 0 {
            return Err(DaqError::Configuration(
                "Histogram needs at least one bin".into(),
            ));
        }
        if !min.is_finite() || !max.is_finite() || max <= min {
            return Err(DaqError::Configuration(format!(
                "Invalid histogram range [{min}, {max}]"
            )));
        }

        let width = (max - min) / bins as f64;
        let edges = (0..bins)
            .map(|i| min + i as f64 * width)
            .chain(iter::once(max))
            .collect();

        Ok(Self {
            min,
            max,
            counts: vec![0; bins],
            edges,
        })
    }

    /// Add every value in `values` to its bin.
    pub fn fill(&mut self, values: &[f64]) {
        for &value in values {
            if let Some(idx) = self.bin_index(value) {
                self.counts[idx] += 1;
            }
        }
    }

    /// Index of the bin `value` falls into, or `None` if it is out of range.
    pub fn bin_index(&self, value: f64) -> Option<usize> {
        // Written this way so NaN is rejected too
        if !(value >= self.min && value <= self.max) {
            return None;
        }
        let bins = self.counts.len();
        let scaled = (value - self.min) / (self.max - self.min) * bins as f64;
        let mut idx = (scaled as usize).min(bins - 1);

        // Float rounding can put a value one bin off its published edges
        if value < self.edges[idx] {
            idx = idx.saturating_sub(1);
        } else if idx + 1 < bins && value >= self.edges[idx + 1] {
            idx += 1;
        }
        Some(idx)
    }

    /// Per-bin counts.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Bin edges, `bins + 1` values from `min` to `max`.
    pub fn bin_edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of bins.
    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    /// Lower bound of the range.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Upper bound of the range.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Sum of all counts.
    pub fn total_events(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Event-rate histogram with unit-width (one second) bins and a growing domain.
///
/// Boundaries are unset until the first fill. Afterwards bin `i` covers
/// `[min_boundary + i, min_boundary + i + 1)` and the boundaries only expand.
/// The upper boundary is stored implicitly as `min_boundary + counts.len()`.
///
/// `fill` expects timestamps in ascending order. Only the first and last value
/// decide whether the domain grows, so unsorted input silently misplaces or loses
/// counts.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeHistogram {
    origin: Option<i64>,
    counts: Vec<u64>,
    growth_chunk: usize,
}

impl TimeHistogram {
    /// Create an empty histogram that grows by `growth_chunk` spare bins at a time.
    pub fn new(growth_chunk: usize) -> Self {
        Self {
            origin: None,
            counts: Vec::new(),
            growth_chunk: growth_chunk.max(1),
        }
    }

    /// Fill an ascending batch of timestamps in seconds.
    ///
    /// Empty batches and batches with non-finite end points are ignored.
    pub fn fill(&mut self, values: &[f64]) {
        let (Some(&first), Some(&last)) = (values.first(), values.last()) else {
            return;
        };
        if !first.is_finite() || !last.is_finite() {
            return;
        }
        let chunk = self.growth_chunk as i64;
        let first_second = first.floor() as i64;

        let mut origin = match self.origin {
            Some(origin) => origin,
            None => {
                self.counts = vec![0; self.growth_chunk];
                first_second
            }
        };

        if first_second < origin {
            let pad = (origin - first_second) as usize;
            self.counts.splice(0..0, iter::repeat(0).take(pad));
            origin = first_second;
        }
        self.origin = Some(origin);

        // Bins are half-open, so a last value sitting exactly on the upper
        // boundary needs growth as well
        let max = origin + self.counts.len() as i64;
        if last.floor() as i64 >= max {
            let new_max = last.ceil() as i64 + chunk;
            self.counts.resize((new_max - origin) as usize, 0);
        }

        let len = self.counts.len() as i64;
        for &value in values {
            let idx = value.floor() as i64 - origin;
            if (0..len).contains(&idx) {
                self.counts[idx as usize] += 1;
            }
        }
    }

    /// Lowest boundary, `None` before the first fill.
    pub fn min_boundary(&self) -> Option<i64> {
        self.origin
    }

    /// Highest boundary, `None` before the first fill.
    pub fn max_boundary(&self) -> Option<i64> {
        self.origin.map(|origin| origin + self.counts.len() as i64)
    }

    /// Per-second counts.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// `[min_boundary, min_boundary + 1, ..., max_boundary]`, empty before the first
    /// fill.
    pub fn bin_edges(&self) -> Vec<i64> {
        match (self.min_boundary(), self.max_boundary()) {
            (Some(min), Some(max)) => (min..=max).collect(),
            _ => Vec::new(),
        }
    }

    /// Sum of all counts.
    pub fn total_events(&self) -> u64 {
        self.counts.iter().sum()
    }
}
