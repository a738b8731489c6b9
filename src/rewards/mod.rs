//! 보상 큐 모듈

pub mod amounts;
pub mod ledger;
pub mod queue;

pub use amounts::*;
pub use ledger::*;
pub use queue::*;
