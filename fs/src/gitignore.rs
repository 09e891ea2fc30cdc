// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::Stat;

///
/// Exclude patterns with gitignore semantics, applied to every filesystem operation that walks
/// or watches the build root.
///
#[derive(Debug)]
pub struct GitignoreStyleExcludes {
    patterns: Vec<String>,
    gitignore: Gitignore,
}

impl GitignoreStyleExcludes {
    pub fn create(patterns: Vec<String>) -> Result<Arc<Self>, String> {
        if patterns.is_empty() {
            return Ok(Self::empty());
        }

        let mut ignore_builder = GitignoreBuilder::new("");
        for pattern in &patterns {
            ignore_builder
                .add_line(None, pattern)
                .map_err(|e| format!("Could not parse glob {pattern:?}: {e:?}"))?;
        }
        let gitignore = ignore_builder
            .build()
            .map_err(|e| format!("Could not build ignore patterns: {e:?}"))?;

        Ok(Arc::new(Self {
            patterns,
            gitignore,
        }))
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            patterns: vec![],
            gitignore: Gitignore::empty(),
        })
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_ignored(&self, stat: &Stat) -> bool {
        let is_dir = matches!(stat, &Stat::Dir(_));
        self.is_ignored_path(stat.path(), is_dir)
    }

    pub fn is_ignored_path(&self, path: &Path, is_dir: bool) -> bool {
        match self.gitignore.matched(path, is_dir) {
            ignore::Match::None | ignore::Match::Whitelist(_) => false,
            ignore::Match::Ignore(_) => true,
        }
    }

    pub fn is_ignored_or_child_of_ignored_path(&self, path: &Path, is_dir: bool) -> bool {
        match self.gitignore.matched_path_or_any_parents(path, is_dir) {
            ignore::Match::None | ignore::Match::Whitelist(_) => false,
            ignore::Match::Ignore(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::GitignoreStyleExcludes;

    #[test]
    fn empty_ignores_nothing() {
        let excludes = GitignoreStyleExcludes::empty();
        assert!(!excludes.is_ignored_path(Path::new("a/b.py"), false));
    }

    #[test]
    fn patterns_apply_gitignore_semantics() {
        let excludes =
            GitignoreStyleExcludes::create(vec!["*.pyc".to_owned(), "/dist/".to_owned()]).unwrap();
        assert!(excludes.is_ignored_path(Path::new("a/b.pyc"), false));
        assert!(excludes.is_ignored_path(Path::new("dist"), true));
        assert!(!excludes.is_ignored_path(Path::new("a/dist"), false));
        assert!(!excludes.is_ignored_path(Path::new("a/b.py"), false));
    }

    #[test]
    fn negations_reinclude() {
        let excludes =
            GitignoreStyleExcludes::create(vec!["*.log".to_owned(), "!keep.log".to_owned()])
                .unwrap();
        assert!(excludes.is_ignored_path(Path::new("noise.log"), false));
        assert!(!excludes.is_ignored_path(Path::new("keep.log"), false));
    }

    #[test]
    fn children_of_ignored_dirs() {
        let excludes = GitignoreStyleExcludes::create(vec!["/dist/".to_owned()]).unwrap();
        assert!(excludes.is_ignored_or_child_of_ignored_path(Path::new("dist/out.whl"), false));
        assert!(!excludes.is_ignored_or_child_of_ignored_path(Path::new("src/out.whl"), false));
    }
}
