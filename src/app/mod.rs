//! Binary-only helpers.

pub(crate) mod progress_bar;
