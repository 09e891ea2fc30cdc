// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use fs::RelativePath;
use serde::Serialize;
use store::WorkdirSymlink;

///
/// A validated name for an append-only cache directory.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheName(String);

impl CacheName {
    pub fn new(name: String) -> Result<CacheName, String> {
        if name
            .chars()
            .all(|c| (c.is_ascii_alphanumeric() && c.is_ascii_lowercase()) || c == '_')
        {
            Ok(CacheName(name))
        } else {
            Err(format!(
                "Cache names may only contain lowercase alphanumeric characters or underscores: \
                got {name:?}"
            ))
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

///
/// Append-only cache directories shared by all sandboxes on this host. Each sandbox sees them
/// via symlinks from its declared relative paths.
///
/// Because a running process may write to a cache concurrently with others reading it, caches
/// must genuinely be append-only: consumers declare them explicitly in the Process datamodel.
///
#[derive(Clone)]
pub struct NamedCaches {
    ///
    /// The absolute path to the base of the directory storing named caches. This may be a
    /// location on disk, in which case paths are created as symlinks into that location.
    ///
    local_base: PathBuf,
}

impl NamedCaches {
    pub fn new_local(local_base: PathBuf) -> NamedCaches {
        NamedCaches { local_base }
    }

    pub fn base_path(&self) -> &Path {
        &self.local_base
    }

    ///
    /// Returns symlinks to create for the given set of NamedCaches, creating the backing
    /// directories as a side effect.
    ///
    pub async fn paths<'a>(
        &'a self,
        caches: &'a std::collections::BTreeMap<CacheName, RelativePath>,
    ) -> Result<Vec<WorkdirSymlink>, String> {
        let symlinks = caches
            .iter()
            .map(move |(cache_name, workdir_relative_path)| WorkdirSymlink {
                src: workdir_relative_path.clone(),
                dst: self.local_base.join(&cache_name.0),
            })
            .collect::<Vec<_>>();

        for symlink in &symlinks {
            tokio::fs::create_dir_all(&symlink.dst).await.map_err(|err| {
                format!(
                    "Error creating directory {}: {err:?}",
                    symlink.dst.display()
                )
            })?
        }

        Ok(symlinks)
    }
}

#[cfg(test)]
mod tests {
    use super::CacheName;

    #[test]
    fn cache_name_validation() {
        CacheName::new("pip_cache".to_owned()).unwrap();
        CacheName::new("v2".to_owned()).unwrap();
        CacheName::new("Pip".to_owned()).expect_err("want err");
        CacheName::new("pip-cache".to_owned()).expect_err("want err");
        CacheName::new("pip cache".to_owned()).expect_err("want err");
    }
}
