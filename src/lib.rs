// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A persistent, MVCC-aware KD-tree nearest-neighbour index for
//! fixed-dimension float vectors.
//!
//! ##### NOTE
//!
//! > This crate only provides the index engine, not a full database.
//! > Transactions here are the thin slice a host system would supply:
//! > timestamps, writer overlap checks and in-progress tracking.
//!
//! ##### About
//!
//! Vectors are keyed by a 32-bit ROWID. Writes are absorbed by a
//! mutable in-memory *small index* backed by a B-tree data file; the
//! bulk of the data lives in an immutable *main index* that is bulk
//! built in parallel and dumped to a paged file. When a small file
//! grows past a threshold, a background merge drains it into the main
//! data file, rebuilds the main index and flips a persisted bit that
//! selects which of the two small files accepts writes.
//!
//! Queries run a best-first or classic KD-tree search over the three
//! indices in parallel, bounded by a distance-computation budget:
//! exactness is traded for a hard cost ceiling, and the result marks
//! when that happened. Snapshot readers select index versions by their
//! birth timestamp, so merges never disturb running queries.
//!
//! # Example usage
//!
//! ```
//! use kd_index::{Config, Engine, TraceType};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let engine = Engine::new();
//!
//! // One store indexes vectors of a fixed dimension
//! let file = Config::new(folder.path(), 2).open(&engine)?;
//!
//! let tx = engine.begin_read_write();
//! file.insert(&tx, 1, &[0.0, 0.0])?;
//! file.insert(&tx, 2, &[1.0, 0.0])?;
//! file.insert(&tx, 3, &[0.0, 1.0])?;
//! tx.commit();
//!
//! let tx = engine.begin_no_version();
//! let results = file.nnsearch(
//!     &tx,
//!     &[vec![0.1, 0.1]],
//!     TraceType::Normal,
//!     /* distance budget */ 1_000,
//!     /* k */ 2,
//! )?;
//!
//! assert_eq!(1, results[0].hits[0].rowid);
//! #
//! # Ok::<(), kd_index::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

mod abort;
mod arena;
mod bitset;

pub mod coding;

mod config;
mod engine;
mod error;

#[doc(hidden)]
pub mod file;

mod index;
mod index_set;
mod merge_daemon;
mod merge_reserve;
mod node;
mod parallel;
mod search;
mod tx;

pub use {
    abort::AbortSignal,
    bitset::RowIdSet,
    config::Config,
    engine::{Engine, LogRecord},
    error::{Error, Result},
    file::{KdTreeFile, SmallRole, VerifyReport},
    merge_reserve::JobType,
    search::{Hit, QueryResult, TraceType},
    tx::{TimeStamp, Transaction, TransactionManager, TxId, TxMode, ILLEGAL_TIMESTAMP},
};
