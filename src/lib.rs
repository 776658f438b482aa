//! # litekv
//!
//! An embeddable, persistent key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Designed for
//! fast writes and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Engine                          │
//! │  ┌────────────────┐          ┌──────────────────┐    │
//! │  │ Active Memtable │  rotate │  Segments (disk)  │    │
//! │  │    + WAL        │ ───────►│  newest → oldest  │    │
//! │  └────────┬────────┘         └─────────▲─────────┘    │
//! │           │  background flush          │              │
//! │           └─────────────────────────────┘              │
//! │                                                        │
//! │          compact(): merge all segments into one        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Coordinator — open, put, get, flush, compact, close |
//! | [`memtable`] | In-memory sorted write buffer |
//! | [`wal`] | Headerless, checksumless write-ahead log for crash recovery |
//! | [`segment`] | Immutable, sorted, on-disk files with a sparse index |
//!
//! ## Key features
//!
//! - **Write-ahead logging** — every mutation is persisted to the WAL
//!   before being acknowledged, guaranteeing durability and crash
//!   recovery; a torn tail left by a crash mid-write is tolerated
//!   silently rather than surfaced as an error.
//! - **Non-blocking flush** — a full memtable is rotated out and handed
//!   to a background worker; `put` never waits on segment I/O.
//! - **Full-merge compaction** — `compact()` merges every segment into
//!   one, resolving key collisions in favor of the newer segment.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use litekv::engine::{Engine, EngineOptions};
//!
//! let engine = Engine::open("/tmp/my_db", EngineOptions::default()).unwrap();
//!
//! engine.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! engine.compact().unwrap();
//! engine.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod engine;
pub mod memtable;
pub mod segment;
pub mod wal;
