mod classify;
mod engine;

pub use classify::{Classifier, PathPattern, Route};
pub use engine::StrategyEngine;
pub(crate) use engine::fetch_network;
