//! The `Node` sum type: one tagged union covering every kind of tree entry
//! (local file/dir, remote file/dir, container, ephemeral placeholder)
//! instead of a class hierarchy — behavior dispatches on the variant rather
//! than on subclass.

use std::path::PathBuf;
use std::time::SystemTime;

use super::identifier::{DeviceUid, NodeIdentifier, Uid};

/// A content signature pair. `None` until the Signature Pipeline fills it in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
	pub md5: Option<String>,
	pub sha256: Option<String>,
}

impl Signature {
	pub fn is_complete(&self) -> bool {
		self.md5.is_some() && self.sha256.is_some()
	}

	pub fn is_empty(&self) -> bool {
		self.md5.is_none() && self.sha256.is_none()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
	pub identifier: NodeIdentifier,
	pub size: u64,
	pub mtime_ms: i64,
	pub ctime_ms: i64,
	pub signature: Signature,
	pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDir {
	pub identifier: NodeIdentifier,
	/// Derived bottom-up; see `domain::DirectoryStats`.
	pub size: u64,
	pub file_count: u64,
	pub dir_count: u64,
	pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
	pub identifier: NodeIdentifier,
	pub cloud_id: String,
	pub size: u64,
	pub mtime_ms: i64,
	pub ctime_ms: i64,
	pub md5: Option<String>,
	pub owner: Option<String>,
	pub version: u64,
	pub head_revision: Option<String>,
	pub shared: bool,
	pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDir {
	pub identifier: NodeIdentifier,
	pub cloud_id: String,
	pub my_drive: bool,
	pub shared: bool,
	pub trashed: bool,
	pub children_complete: bool,
}

/// Pure display scaffolding — never persisted, never diffed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Container {
	Category(String),
	RootType(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ephemeral {
	Loading,
	Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
	LocalFile(LocalFile),
	LocalDir(LocalDir),
	RemoteFile(RemoteFile),
	RemoteDir(RemoteDir),
	Container(Container),
	Ephemeral(Ephemeral),
}

impl Node {
	pub fn uid(&self) -> Option<Uid> {
		match self {
			Self::LocalFile(f) => Some(f.identifier.uid),
			Self::LocalDir(d) => Some(d.identifier.uid),
			Self::RemoteFile(f) => Some(f.identifier.uid),
			Self::RemoteDir(d) => Some(d.identifier.uid),
			Self::Container(_) | Self::Ephemeral(_) => None,
		}
	}

	pub fn device_uid(&self) -> Option<DeviceUid> {
		match self {
			Self::LocalFile(f) => Some(f.identifier.device_uid),
			Self::LocalDir(d) => Some(d.identifier.device_uid),
			Self::RemoteFile(f) => Some(f.identifier.device_uid),
			Self::RemoteDir(d) => Some(d.identifier.device_uid),
			Self::Container(_) | Self::Ephemeral(_) => None,
		}
	}

	pub fn is_file(&self) -> bool {
		matches!(self, Self::LocalFile(_) | Self::RemoteFile(_))
	}

	pub fn is_dir(&self) -> bool {
		matches!(self, Self::LocalDir(_) | Self::RemoteDir(_))
	}

	pub fn is_trashed(&self) -> bool {
		match self {
			Self::LocalFile(f) => f.trashed,
			Self::LocalDir(d) => d.trashed,
			Self::RemoteFile(f) => f.trashed,
			Self::RemoteDir(d) => d.trashed,
			Self::Container(_) | Self::Ephemeral(_) => false,
		}
	}

	/// MD5 signature, if known, regardless of backend.
	pub fn md5(&self) -> Option<&str> {
		match self {
			Self::LocalFile(f) => f.signature.md5.as_deref(),
			Self::RemoteFile(f) => f.md5.as_deref(),
			_ => None,
		}
	}

	pub fn size(&self) -> u64 {
		match self {
			Self::LocalFile(f) => f.size,
			Self::LocalDir(d) => d.size,
			Self::RemoteFile(f) => f.size,
			Self::RemoteDir(_) => 0,
			Self::Container(_) | Self::Ephemeral(_) => 0,
		}
	}

	pub fn mtime_ms(&self) -> Option<i64> {
		match self {
			Self::LocalFile(f) => Some(f.mtime_ms),
			Self::RemoteFile(f) => Some(f.mtime_ms),
			_ => None,
		}
	}

	pub fn single_path(&self) -> Option<&PathBuf> {
		match self {
			Self::LocalFile(f) => f.identifier.spid_path(),
			Self::LocalDir(d) => d.identifier.spid_path(),
			Self::RemoteFile(f) => f.identifier.spid_path(),
			Self::RemoteDir(d) => d.identifier.spid_path(),
			Self::Container(_) | Self::Ephemeral(_) => None,
		}
	}

	/// Whether this file node still needs a signature computed — the
	/// predicate the Signature Pipeline's subscription callback matches on.
	pub fn needs_signature(&self) -> bool {
		match self {
			Self::LocalFile(f) => f.is_file() && f.signature.is_empty(),
			_ => false,
		}
	}
}

impl LocalFile {
	fn is_file(&self) -> bool {
		true
	}
}

pub fn unix_epoch_ms(t: SystemTime) -> i64 {
	t.duration_since(SystemTime::UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}
