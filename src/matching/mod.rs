//! 매칭 엔진 모듈

pub mod engine;
pub mod scoring;

pub use engine::*;
pub use scoring::*;
