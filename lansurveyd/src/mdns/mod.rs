pub mod browser;
pub mod cache;
