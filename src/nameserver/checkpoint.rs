//! Namespace image persistence.
//!
//! The image is a JSON document next to a file holding its SHA-256 digest. Both are written to
//! temporary names first and renamed into place.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::info;
use uuid::Uuid;

use crate::error::{DfsError, Result};
use crate::nameserver::namespace::Namespace;

const IMAGE_FILE: &str = "fsimage.json";
const DIGEST_FILE: &str = "fsimage.sha256";
const IMAGE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub(crate) struct FileSystemImage {
    pub version: u32,
    pub file_system_id: Uuid,
    pub namespace: Namespace,
}

impl FileSystemImage {
    pub fn new(file_system_id: Uuid, namespace: Namespace) -> Self {
        FileSystemImage {
            version: IMAGE_VERSION,
            file_system_id,
            namespace,
        }
    }
}

fn sha256sum(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut result = [0u8; 32];
    result.copy_from_slice(digest.as_slice());
    result
}

pub(crate) fn save_image(directory: &Path, image: &FileSystemImage) -> Result<()> {
    std::fs::create_dir_all(directory)?;
    let data = serde_json::to_vec(image)?;
    let digest = hex::encode(sha256sum(&data));

    let image_tmp = directory.join(format!("{IMAGE_FILE}.tmp"));
    let digest_tmp = directory.join(format!("{DIGEST_FILE}.tmp"));
    std::fs::write(&image_tmp, &data)?;
    std::fs::write(&digest_tmp, &digest)?;
    std::fs::rename(&image_tmp, directory.join(IMAGE_FILE))?;
    std::fs::rename(&digest_tmp, directory.join(DIGEST_FILE))?;

    info!(directory = %directory.display(), bytes = data.len(), "wrote namespace checkpoint");
    Ok(())
}

/// Load the image in `directory`, or `None` if no checkpoint was ever written there.
pub(crate) fn load_image(directory: &Path) -> Result<Option<FileSystemImage>> {
    let image_path = directory.join(IMAGE_FILE);
    if !image_path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(&image_path)?;
    let expected = std::fs::read_to_string(directory.join(DIGEST_FILE))
        .map_err(|e| DfsError::Checkpoint(format!("missing checkpoint digest: {e}")))?;
    let actual = hex::encode(sha256sum(&data));
    if expected.trim() != actual {
        return Err(DfsError::Checkpoint(format!(
            "checkpoint digest mismatch: expected {}, computed {actual}",
            expected.trim()
        )));
    }

    let image: FileSystemImage = serde_json::from_slice(&data)?;
    if image.version != IMAGE_VERSION {
        return Err(DfsError::Checkpoint(format!("unsupported image version {}", image.version)));
    }
    Ok(Some(image))
}
