//! Crate-wide error taxonomy.
//!
//! Each subsystem owns a narrow `thiserror` enum (see `uid::UidError`,
//! `identity::MapperError`, `tree_store::TreeStoreError`, etc.) and this
//! module composes them behind one `CoreError` so callers crossing module
//! boundaries don't have to thread five different error types. The
//! `ErrorClass` trait is a five-way taxonomy
//! (NotFound / Conflict / Transient / Permanent / Invariant); the Command
//! Executor consults it to decide retry vs. surface instead of matching on
//! every concrete variant.

use thiserror::Error;

use crate::db::DbError;
use crate::diff_engine::DiffError;
use crate::executor::ExecutorError;
use crate::hash::HashError;
use crate::identity::MapperError;
use crate::op_graph::OpGraphError;
use crate::tree_store::TreeStoreError;
use crate::uid::UidError;

#[derive(Debug, Error)]
pub enum CoreError {
	#[error(transparent)]
	Uid(#[from] UidError),
	#[error(transparent)]
	Mapper(#[from] MapperError),
	#[error(transparent)]
	Hash(#[from] HashError),
	#[error(transparent)]
	Db(#[from] DbError),
	#[error(transparent)]
	TreeStore(#[from] TreeStoreError),
	#[error(transparent)]
	Diff(#[from] DiffError),
	#[error(transparent)]
	OpGraph(#[from] OpGraphError),
	#[error(transparent)]
	Executor(#[from] ExecutorError),
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),
	#[error("config error: {0}")]
	Config(String),
}

/// The five-way error taxonomy used to drive retry/cancel decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Cache miss or backend reports item gone; recovered by refresh.
	NotFound,
	/// Signature mismatch or concurrent modification; fails the op, surfaced.
	Conflict,
	/// Network/IO timeout; retried per `max_retries` with backoff.
	Transient,
	/// Permission denied, quota exceeded, malformed response; fails the batch.
	Permanent,
	/// UID collision, graph cycle, negative size; fatal, subsystem shuts down.
	Invariant,
}

pub trait Classify {
	fn class(&self) -> ErrorClass;
}

impl Classify for CoreError {
	fn class(&self) -> ErrorClass {
		match self {
			Self::Uid(e) => e.class(),
			Self::Mapper(e) => e.class(),
			Self::Hash(_) => ErrorClass::Transient,
			Self::Db(e) => e.class(),
			Self::TreeStore(e) => e.class(),
			Self::Diff(e) => e.class(),
			Self::OpGraph(e) => e.class(),
			Self::Executor(e) => e.class(),
			Self::Io(_) => ErrorClass::Transient,
			Self::Config(_) => ErrorClass::Permanent,
		}
	}
}

impl ErrorClass {
	/// Whether the Command Executor should retry an op that failed with
	/// this class, as opposed to surfacing it or cancelling dependents.
	pub fn is_retryable(self) -> bool {
		matches!(self, Self::Transient)
	}
}
