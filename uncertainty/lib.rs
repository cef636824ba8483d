#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod accumulate;
pub mod blocks;
pub mod config;
pub mod debug;
pub mod fabric;
pub mod nodes;
pub mod output;
pub mod pipeline;
pub mod prepare;
pub mod progress;
pub mod rayweights;
pub mod retry;
pub mod task;
pub mod types;
