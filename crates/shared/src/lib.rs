//! Wire model shared by the research session client and its front ends.

pub mod domain;
pub mod error;
pub mod protocol;
