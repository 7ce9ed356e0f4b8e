#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Judge-facing engine for `ojc`: the OJ HTTP client, the captcha solver
//! handle, the persistence contract and its JSON-file implementation, the
//! account pool manager, the real probe submitter, and the task orchestrator.

pub mod captcha;
pub mod error;
pub mod oj;
pub mod pool;
pub mod retry;
pub mod store;
pub mod submit;
pub mod task;
