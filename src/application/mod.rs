//! Application layer: the write path, event routing, billing close and the
//! read projections, wired together by [`engine::LedgerEngine`].

pub mod applier;
pub mod closer;
pub mod engine;
pub mod identity;
pub mod locks;
pub mod pricing;
pub mod query;
pub mod retry;
pub mod router;
