//! Domain types: bars, bar series, intervals and periods.

pub mod bar;
pub mod interval;

pub use bar::{Bar, BarSeries};
pub use interval::{Interval, Period};
