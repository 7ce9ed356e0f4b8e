#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Judge-independent core of the `ojc` extraction client: the memory
//! measurement model, probe code templates, and the resumable crawler state
//! machine that reconstructs hidden test cases from decoded probe answers.

pub mod bytes;
pub mod config;
pub mod crawler;
pub mod model;
pub mod template;
