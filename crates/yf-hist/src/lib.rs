//! # yf-hist
//!
//! Weighted histograms for yieldfit and the binned aggregator that turns
//! per-event observable arrays into 1D or 2D count/error grids.
//!
//! ## Example
//!
//! ```
//! use yf_core::BinEdges;
//! use yf_hist::aggregate;
//!
//! let bins = BinEdges::new(vec![0.0, 0.5, 1.5, 4.0]).unwrap();
//! let h = aggregate(&[0.2, 1.0, 3.0, 9.0], &[1.0, 1.0, 2.0, 1.0], &bins, None).unwrap();
//! assert_eq!(h.counts.as_slice(), &[1.0, 1.0, 2.0]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod histogram;

pub use aggregate::{Secondary, aggregate, sum_weights};
pub use histogram::{BinnedHistogram, Grid, Histogram1D};
