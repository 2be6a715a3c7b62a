#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod ensemble;
pub mod export;
pub mod labels;
pub mod pipeline;
pub mod predict;
pub mod regional;
pub mod render;
pub mod types;
pub mod volume;
