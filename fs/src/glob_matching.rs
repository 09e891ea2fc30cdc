// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use glob::Pattern;
use log::warn;

use crate::{
    Dir, GitignoreStyleExcludes, GlobExpansionConjunction, Link, PathStat, Stat,
    StrictGlobMatching, SymlinkBehavior, Vfs, LinkDepth, MAX_LINK_DEPTH,
};

pub const DOUBLE_STAR_GLOB: &str = "**";
const SINGLE_STAR_GLOB: &str = "*";

///
/// A filespec, parsed into a position in the filesystem: a canonical directory to scan, the
/// symbolic path matched so far, and the pattern(s) left to match below it.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PathGlob {
    Wildcard {
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        wildcard: Pattern,
    },
    DirWildcard {
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        wildcard: Pattern,
        remainder: Vec<Pattern>,
    },
}

impl PathGlob {
    fn wildcard(canonical_dir: Dir, symbolic_path: PathBuf, wildcard: Pattern) -> PathGlob {
        PathGlob::Wildcard {
            canonical_dir,
            symbolic_path,
            wildcard,
        }
    }

    fn dir_wildcard(
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        wildcard: Pattern,
        remainder: Vec<Pattern>,
    ) -> PathGlob {
        PathGlob::DirWildcard {
            canonical_dir,
            symbolic_path,
            wildcard,
            remainder,
        }
    }

    ///
    /// Parse a filespec into a series of PathGlobs rooted at the given position.
    ///
    pub fn create(filespec: &str) -> Result<Vec<PathGlob>, String> {
        let parts = Path::new(filespec)
            .components()
            .filter(|component| !matches!(component, std::path::Component::CurDir))
            .map(|component| {
                let part = component
                    .as_os_str()
                    .to_str()
                    .ok_or_else(|| format!("Filespec was not unicode: {filespec:?}"))?;
                Pattern::new(part)
                    .map_err(|e| format!("Could not parse {filespec:?} as a glob: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if parts.is_empty() {
            return Err(format!("Filespec was empty: {filespec:?}"));
        }

        Ok(Self::parse_globs(Dir(PathBuf::new()), PathBuf::new(), &parts))
    }

    fn parse_globs(
        canonical_dir: Dir,
        symbolic_path: PathBuf,
        parts: &[Pattern],
    ) -> Vec<PathGlob> {
        // NB: A leading doublestar must expand both to zero directories (the remainder applied
        // here) and to one-or-more directories (a single star wildcard which preserves the
        // doublestar in its remainder).
        if parts.len() == 1 {
            if parts[0].as_str() == DOUBLE_STAR_GLOB {
                let single_star = Pattern::new(SINGLE_STAR_GLOB).unwrap();
                let double_star = parts[0].clone();
                vec![
                    PathGlob::dir_wildcard(
                        canonical_dir.clone(),
                        symbolic_path.clone(),
                        single_star.clone(),
                        vec![double_star],
                    ),
                    PathGlob::wildcard(canonical_dir, symbolic_path, single_star),
                ]
            } else {
                vec![PathGlob::wildcard(
                    canonical_dir,
                    symbolic_path,
                    parts[0].clone(),
                )]
            }
        } else if parts[0].as_str() == DOUBLE_STAR_GLOB {
            let mut globs = vec![PathGlob::dir_wildcard(
                canonical_dir.clone(),
                symbolic_path.clone(),
                Pattern::new(SINGLE_STAR_GLOB).unwrap(),
                parts.to_vec(),
            )];
            globs.extend(Self::parse_globs(canonical_dir, symbolic_path, &parts[1..]));
            globs
        } else {
            vec![PathGlob::dir_wildcard(
                canonical_dir,
                symbolic_path,
                parts[0].clone(),
                parts[1..].to_vec(),
            )]
        }
    }
}

#[derive(Clone, Debug)]
struct PathGlobIncludeEntry {
    input: String,
    globs: Vec<PathGlob>,
}

///
/// A set of parsed globs with their exclude patterns and match-strictness policy.
///
#[derive(Clone, Debug)]
pub struct PreparedPathGlobs {
    include: Vec<PathGlobIncludeEntry>,
    exclude: Arc<GitignoreStyleExcludes>,
    strict_match_behavior: StrictGlobMatching,
    conjunction: GlobExpansionConjunction,
}

impl PreparedPathGlobs {
    pub fn create(
        globs: Vec<String>,
        strict_match_behavior: StrictGlobMatching,
        conjunction: GlobExpansionConjunction,
    ) -> Result<PreparedPathGlobs, String> {
        let mut include = Vec::new();
        let mut exclude_patterns = Vec::new();
        for glob in globs {
            if let Some(stripped) = glob.strip_prefix('!') {
                exclude_patterns.push(stripped.to_owned());
            } else {
                include.push(PathGlobIncludeEntry {
                    globs: PathGlob::create(&glob)?,
                    input: glob,
                });
            }
        }

        Ok(PreparedPathGlobs {
            include,
            exclude: GitignoreStyleExcludes::create(exclude_patterns)?,
            strict_match_behavior,
            conjunction,
        })
    }
}

#[async_trait]
pub trait GlobMatching<E: Display + Send + Sync + 'static>: Vfs<E> {
    ///
    /// Canonicalize the Link for the given Path to an underlying File or Dir. May result in
    /// None if the link was a dead or self-referential link.
    ///
    async fn canonicalize_link(
        &self,
        symbolic_path: PathBuf,
        link: Link,
    ) -> Result<Option<PathStat>, E> {
        GlobMatchingImplementation::canonicalize_link(self, symbolic_path, link, 0).await
    }

    ///
    /// Recursively expands PathGlobs into PathStats while applying excludes.
    ///
    async fn expand_globs(
        &self,
        path_globs: PreparedPathGlobs,
        symlink_behavior: SymlinkBehavior,
        unmatched_globs_additional_context: Option<String>,
    ) -> Result<Vec<PathStat>, E> {
        GlobMatchingImplementation::expand_globs(
            self,
            path_globs,
            symlink_behavior,
            unmatched_globs_additional_context,
        )
        .await
    }
}

impl<E: Display + Send + Sync + 'static, T: Vfs<E>> GlobMatching<E> for T {}

#[async_trait]
trait GlobMatchingImplementation<E: Display + Send + Sync + 'static>: Vfs<E> {
    async fn expand_globs(
        &self,
        path_globs: PreparedPathGlobs,
        symlink_behavior: SymlinkBehavior,
        unmatched_globs_additional_context: Option<String>,
    ) -> Result<Vec<PathStat>, E> {
        let mut matched_by_position = Vec::with_capacity(path_globs.include.len());
        let mut result: HashMap<PathBuf, PathStat> = HashMap::new();

        // Each include entry is expanded independently so that strict matching can report which
        // of the input globs went unmatched.
        for entry in &path_globs.include {
            let mut entry_result = HashMap::new();
            self.expand_entry(
                &mut entry_result,
                &path_globs.exclude,
                &entry.globs,
                symlink_behavior,
            )
            .await?;
            matched_by_position.push(!entry_result.is_empty());
            result.extend(entry_result);
        }

        if path_globs.strict_match_behavior.should_check_glob_matches() {
            let unmatched: Vec<&str> = path_globs
                .include
                .iter()
                .zip(matched_by_position.iter())
                .filter_map(|(entry, matched)| {
                    if *matched {
                        None
                    } else {
                        Some(entry.input.as_str())
                    }
                })
                .collect();

            let failed = match path_globs.conjunction {
                GlobExpansionConjunction::AllMatch => !unmatched.is_empty(),
                GlobExpansionConjunction::AnyMatch => {
                    !path_globs.include.is_empty() && unmatched.len() == path_globs.include.len()
                }
            };

            if failed {
                let origin = match &path_globs.strict_match_behavior {
                    StrictGlobMatching::Error(origin) | StrictGlobMatching::Warn(origin) => origin,
                    StrictGlobMatching::Ignore => unreachable!(),
                };
                let msg = format!(
                    "Unmatched glob(s) from {origin}: {unmatched:?}{}",
                    unmatched_globs_additional_context.unwrap_or_default()
                );
                if path_globs.strict_match_behavior.should_throw_on_error() {
                    return Err(Self::mk_error(&msg));
                } else {
                    warn!("{msg}");
                }
            }
        }

        let mut path_stats: Vec<PathStat> = result.into_values().collect();
        path_stats.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(path_stats)
    }

    async fn expand_entry(
        &self,
        result: &mut HashMap<PathBuf, PathStat>,
        exclude: &Arc<GitignoreStyleExcludes>,
        globs: &[PathGlob],
        symlink_behavior: SymlinkBehavior,
    ) -> Result<(), E> {
        let mut queue: VecDeque<PathGlob> = globs.iter().cloned().collect();
        let mut visited: HashSet<PathGlob> = queue.iter().cloned().collect();

        while let Some(path_glob) = queue.pop_front() {
            match path_glob {
                PathGlob::Wildcard {
                    canonical_dir,
                    symbolic_path,
                    wildcard,
                } => {
                    for stat in
                        self.directory_listing(&canonical_dir, &wildcard, exclude).await?
                    {
                        let symbolic = symbolic_path.join(stat.path().file_name().unwrap());
                        let path_stat = match stat {
                            Stat::Dir(ref dir) => Some(PathStat::dir(
                                symbolic.clone(),
                                Dir(canonical_dir.0.join(&dir.0)),
                            )),
                            Stat::File(ref file) => Some(PathStat::file(
                                symbolic.clone(),
                                crate::File {
                                    path: canonical_dir.0.join(&file.path),
                                    is_executable: file.is_executable,
                                },
                            )),
                            Stat::Link(ref link) => {
                                let link = Link {
                                    path: canonical_dir.0.join(&link.path),
                                    target: link.target.clone(),
                                };
                                match symlink_behavior {
                                    SymlinkBehavior::Aware => {
                                        Some(PathStat::link(symbolic.clone(), link))
                                    }
                                    SymlinkBehavior::Oblivious => {
                                        GlobMatchingImplementation::canonicalize_link(
                                            self,
                                            symbolic.clone(),
                                            link,
                                            0,
                                        )
                                        .await?
                                    }
                                }
                            }
                        };
                        if let Some(path_stat) = path_stat {
                            result.insert(symbolic, path_stat);
                        }
                    }
                }
                PathGlob::DirWildcard {
                    canonical_dir,
                    symbolic_path,
                    wildcard,
                    remainder,
                } => {
                    for stat in
                        self.directory_listing(&canonical_dir, &wildcard, exclude).await?
                    {
                        let symbolic = symbolic_path.join(stat.path().file_name().unwrap());
                        let maybe_dir = match stat {
                            Stat::Dir(ref dir) => Some(Dir(canonical_dir.0.join(&dir.0))),
                            Stat::Link(ref link) => {
                                let link = Link {
                                    path: canonical_dir.0.join(&link.path),
                                    target: link.target.clone(),
                                };
                                match GlobMatchingImplementation::canonicalize_link(
                                    self,
                                    symbolic.clone(),
                                    link,
                                    0,
                                )
                                .await?
                                {
                                    Some(PathStat::Dir { stat, .. }) => Some(stat),
                                    _ => None,
                                }
                            }
                            Stat::File(_) => None,
                        };

                        if let Some(dir) = maybe_dir {
                            for glob in PathGlob::parse_globs(dir, symbolic.clone(), &remainder) {
                                if visited.insert(glob.clone()) {
                                    queue.push_back(glob);
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    ///
    /// List the given directory, returning entries whose names match the wildcard and which are
    /// not excluded.
    ///
    async fn directory_listing(
        &self,
        canonical_dir: &Dir,
        wildcard: &Pattern,
        exclude: &Arc<GitignoreStyleExcludes>,
    ) -> Result<Vec<Stat>, E> {
        let listing = self.scandir(canonical_dir.clone()).await?;
        Ok(listing
            .0
            .iter()
            .filter(|stat| {
                let matched = stat
                    .path()
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| wildcard.matches(name))
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
                !exclude.is_ignored_path(
                    &canonical_dir.0.join(stat.path()),
                    matches!(stat, Stat::Dir(_)),
                )
            })
            .cloned()
            .collect())
    }

    async fn canonicalize_link(
        &self,
        symbolic_path: PathBuf,
        link: Link,
        link_depth: LinkDepth,
    ) -> Result<Option<PathStat>, E> {
        if link_depth >= MAX_LINK_DEPTH {
            warn!(
                "Maximum link depth exceeded while resolving {:?}: ignoring.",
                link.path
            );
            return Ok(None);
        }

        // Read the link, which returns the destination relative to the root.
        let destination = match self.read_link(&link).await {
            Ok(destination) => destination,
            // A dead link is treated as not existing.
            Err(_) => return Ok(None),
        };

        // Expand the literal destination path to determine its type.
        let dir = match destination.parent() {
            Some(parent) => Dir(parent.to_path_buf()),
            None => Dir(PathBuf::new()),
        };
        let Some(file_name) = destination.file_name().and_then(|name| name.to_str()) else {
            return Ok(None);
        };
        let wildcard = Pattern::new(&Pattern::escape(file_name))
            .map_err(|e| Self::mk_error(&format!("Bad link destination {destination:?}: {e}")))?;

        let listing = self
            .directory_listing(&dir, &wildcard, &GitignoreStyleExcludes::empty())
            .await?;
        let Some(stat) = listing.into_iter().next() else {
            return Ok(None);
        };

        match stat {
            Stat::Dir(d) => Ok(Some(PathStat::dir(symbolic_path, Dir(dir.0.join(&d.0))))),
            Stat::File(f) => Ok(Some(PathStat::file(
                symbolic_path,
                crate::File {
                    path: dir.0.join(&f.path),
                    is_executable: f.is_executable,
                },
            ))),
            Stat::Link(l) => {
                let link = Link {
                    path: dir.0.join(&l.path),
                    target: l.target,
                };
                GlobMatchingImplementation::canonicalize_link(
                    self,
                    symbolic_path,
                    link,
                    link_depth + 1,
                )
                .await
            }
        }
    }
}

impl<E: Display + Send + Sync + 'static, T: Vfs<E>> GlobMatchingImplementation<E> for T {}
