//! `podb` is an embeddable, transactional object-graph database: a graph of
//! user-defined records and their transitive state, persisted to a single
//! append-only log file, with multi-version concurrency control across
//! threads in a process and across independent processes sharing the same
//! file.
//!
//! Reads are served from an in-memory, shared snapshot; writers get a
//! copy-on-write overlay per thread until commit. First-committer-wins
//! semantics apply at commit time, with an optional per-object resolver
//! for merging conflicting writes.
//!
//! ## Getting started
//!
//! ```rust
//! use podb::database::Database;
//! use podb::value::{AttrMap, Value};
//!
//! fn main() -> Result<(), podb::error::Error> {
//!     let dir = tempfile::tempdir()?;
//!     let db = Database::open(dir.path().join("example.podb"))?;
//!
//!     let root = db.new_object(AttrMap::new());
//!     root.set("name".to_string(), Value::Str("alice".to_string()))?;
//!     db.elect(&root);
//!     db.commit()?;
//!
//!     assert_eq!(db.tx_count(), 1);
//!     assert_eq!(root.get("name")?, Some(Value::Str("alice".to_string())));
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod codec;
pub mod database;
pub mod error;
pub mod log;
pub mod mvcc;
pub mod object;
pub mod oid;
pub mod registry;
pub mod snapshot;
pub mod value;
