//! Content Hasher: streams a file in fixed chunks, updating an MD5 and a
//! SHA-256 digest in one pass.
//!
//! A chunked, async, `#[instrument]`-annotated streaming hash that reads
//! the whole file rather than sampling header/footer/middle: the
//! signature needs to detect any content change, not just cheaply
//! fingerprint likely-identical files.

use std::path::Path;

use md5::{Digest, Md5};
use sha2::Sha256;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{instrument, warn};

use crate::domain::node::Signature;
use crate::error::{Classify, ErrorClass};

const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum HashError {
	#[error("failed to read {path}: {source}")]
	Io {
		path: std::path::PathBuf,
		#[source]
		source: std::io::Error,
	},
}

impl Classify for HashError {
	fn class(&self) -> ErrorClass {
		ErrorClass::Transient
	}
}

/// Hashes `path` in one streaming pass. A read error (the file vanished
/// mid-hash, a permission change, ...) yields an empty signature rather
/// than propagating — the caller treats an empty result as "retry later",
/// not a fatal error.
#[instrument(skip(path), fields(path = %path.display()))]
pub async fn hash(path: &Path) -> Signature {
	match hash_inner(path).await {
		Ok(sig) => sig,
		Err(e) => {
			warn!(error = %e, "hash read failed, returning empty signature");
			Signature::default()
		}
	}
}

async fn hash_inner(path: &Path) -> Result<Signature, HashError> {
	let mut file = File::open(path).await.map_err(|source| HashError::Io {
		path: path.to_path_buf(),
		source,
	})?;

	let mut md5 = Md5::new();
	let mut sha256 = Sha256::new();
	let mut buf = vec![0u8; CHUNK_SIZE];

	loop {
		let n = file.read(&mut buf).await.map_err(|source| HashError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		if n == 0 {
			break;
		}
		md5.update(&buf[..n]);
		sha256.update(&buf[..n]);
	}

	Ok(Signature {
		md5: Some(hex::encode(md5.finalize())),
		sha256: Some(hex::encode(sha256.finalize())),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncWriteExt;

	#[tokio::test]
	async fn empty_file_hashes_to_known_digests() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("empty");
		File::create(&path).await.unwrap();

		let sig = hash(&path).await;
		assert!(sig.is_complete());
		// md5("") / sha256("")
		assert_eq!(sig.md5.unwrap(), "d41d8cd98f00b204e9800998ecf8427e");
		assert_eq!(
			sig.sha256.unwrap(),
			"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
		);
	}

	#[tokio::test]
	async fn chunk_boundary_is_handled() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("boundary");
		let mut file = File::create(&path).await.unwrap();
		let data = vec![7u8; CHUNK_SIZE + 1];
		file.write_all(&data).await.unwrap();
		file.flush().await.unwrap();

		let sig = hash(&path).await;
		assert!(sig.is_complete());
	}

	#[tokio::test]
	async fn missing_file_yields_empty_signature() {
		let sig = hash(Path::new("/nonexistent/path/for/coresync/test")).await;
		assert!(sig.is_empty());
	}
}
