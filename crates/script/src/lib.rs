//! Standard script classification, solving and construction.

pub mod standard;
