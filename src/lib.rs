//! Package integrity and conversion pipeline.
//!
//! Fetches third-party installer artifacts from publisher URLs, verifies
//! each against a declared identity (content digest or signer token),
//! normalizes containers into canonical installer packages, consults an
//! external reputation scanner, and publishes clean artifacts to a
//! distribution endpoint with chunked, idempotent uploads. Every entry's
//! outcome lands in an append-only run ledger serialized as the run
//! report.
//!
//! Module map:
//!
//! - [`catalog`] — catalog loading and identity-claim validation
//! - [`fetch`] — streamed HTTP retrieval with inline digesting
//! - [`verify`] — content-hash and publisher-identity verification
//! - [`container`] / [`normalize`] — scoped extraction and canonical
//!   installer synthesis
//! - [`reputation`] — scanner lookup, submission, polling, and policy
//! - [`publish`] — idempotent chunked upload with retry budgets
//! - [`ledger`] — per-entry outcomes and the finalized run report
//! - [`pipeline`] — the worker pool that sequences the stages

pub mod artifact;
pub mod cancel;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod container;
pub mod digest;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod ledger;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod publish;
pub mod reputation;
pub mod verify;
