pub mod engine;

pub use engine::{Engine, EngineBuilder};
