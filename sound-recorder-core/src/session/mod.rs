pub mod bridge;
pub mod recorder;
pub mod resolver;
