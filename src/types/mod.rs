// src/types/mod.rs

pub mod common;
pub mod date;

pub use common::RequestId;
pub use date::ParseDate;
