pub mod analysis;
pub mod cache;
pub mod diagnostics;
pub mod keys;
pub mod mirror;
