//! confman — a strongly-consistent configuration key-value store on Raft.
//!
//! Clients read and write namespaced config entries over HTTP; every write
//! is funneled through a batching replicator into a Raft log, applied by a
//! deterministic state machine on every node, and served back through a
//! linearizable read barrier. Values above a size threshold are lifted out
//! of the log into a content-addressed blob store replicated to a quorum
//! before the pointer commits.
//!
//! Module map:
//!
//! | Module | Role |
//! |--------|------|
//! | [`codec`] | Command/snapshot wire format, hash+compress pipeline |
//! | [`store`] | Durable applied store (LMDB) |
//! | [`blob_store`] | Content-addressed compressed blob files |
//! | [`blob_replicator`] | Quorum push of blobs to peers |
//! | [`blob_resolver`] | Read-side blob fetch with per-id gating |
//! | [`writer`] | Inline-vs-blob write orchestration |
//! | [`raft`] | openraft type config, durable storage, state machine |
//! | [`batcher`] | Single-consumer command batching into Raft entries |
//! | [`read_barrier`] | Linearizable read gate |
//! | [`http_api`] | Public API + internal peer routes |
//! | [`grpc`] | Raft transport + ReadIndex service |
//! | [`cluster`], [`config`] | Static membership, node configuration |
//! | [`errors`], [`metrics`] | HTTP error mapping, prometheus registry |

pub mod batcher;
pub mod blob_replicator;
pub mod blob_resolver;
pub mod blob_store;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod errors;
pub mod grpc;
pub mod http_api;
pub mod metrics;
pub mod raft;
pub mod read_barrier;
pub mod store;
pub mod writer;
