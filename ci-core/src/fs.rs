// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use std::path::Path;
use tokio::fs;

pub async fn exists(entry: impl AsRef<Path>) -> Result<bool> {
    use tokio::io::ErrorKind::NotFound;

    let metadata = fs::metadata(entry).await;

    if let Err(err) = &metadata {
        if err.kind() == NotFound {
            return Ok(false);
        }
    }

    // Return an error if it was anything other than `NotFound`.
    metadata?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn exists_true_for_present_path() {
        let dir = tempdir().unwrap();
        assert!(exists(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn exists_false_for_missing_path() {
        let dir = tempdir().unwrap();
        assert!(!exists(dir.path().join("nope")).await.unwrap());
    }
}
