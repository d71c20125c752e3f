//! Gateway internals, exposed as a library so the binary stays thin and
//! the HTTP surface is testable in-process.

pub mod app;
pub mod http;
pub mod ingest;
pub mod supervisor;
