// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use internment::Intern;

use fs::{self, Dir, DirectoryListing, File, Link, Vfs};
use graph::{CompoundNode, Node};
use rule_graph::DependencyKey;
use store::StoreFileByDigest;
use workunit_store::Level;

use crate::context::{Context, SessionCore};
use crate::core::{display_sorted_in_parens, throw, Failure, Params, TypeId, Value};
use crate::tasks::Rule;

// Sub-modules for the different node kinds.
mod digest_file;
mod execute_process;
mod read_link;
mod root;
mod scandir;
mod snapshot;
mod task;

// Re-export symbols for each kind of node.
pub use self::digest_file::DigestFile;
pub use self::execute_process::{ExecuteProcess, ProcessResult};
pub use self::read_link::{LinkDest, ReadLink};
pub use self::root::Root;
pub use self::scandir::Scandir;
pub use self::snapshot::SnapshotNode;
pub use self::task::{TaskContext, TaskNode};

pub type NodeResult<T> = Result<T, Failure>;

///
/// A Context is sufficient to implement the Vfs and StoreFileByDigest traits, which makes
/// filesystem reads during snapshot capture go through (and be memoized and invalidated by)
/// the corresponding graph nodes.
///
#[async_trait]
impl Vfs<Failure> for Context {
    async fn read_link(&self, link: &Link) -> Result<PathBuf, Failure> {
        Ok(self.get(ReadLink(link.clone())).await?.0)
    }

    async fn scandir(&self, dir: Dir) -> Result<Arc<DirectoryListing>, Failure> {
        self.get(Scandir(dir)).await
    }

    fn is_ignored(&self, stat: &fs::Stat) -> bool {
        self.core.vfs.is_ignored(stat)
    }

    fn mk_error(msg: &str) -> Failure {
        throw(msg.to_owned())
    }
}

impl StoreFileByDigest<Failure> for Context {
    fn store_by_digest(
        &self,
        file: File,
    ) -> BoxFuture<'static, Result<hashing::Digest, Failure>> {
        let context = self.clone();
        async move { context.get(DigestFile(file)).await }.boxed()
    }
}

///
/// Resolve the given rule-graph Entry to a value: run its rule (task or intrinsic) with the
/// params narrowed to those the entry consumes, or produce a param directly.
///
pub(crate) async fn select(
    context: Context,
    mut params: Params,
    entry: Intern<rule_graph::Entry<Rule>>,
) -> NodeResult<Value> {
    params.retain(|k| match entry.as_ref() {
        rule_graph::Entry::Param(type_id) => type_id == k.type_id(),
        rule_graph::Entry::WithDeps(with_deps) => with_deps.params().contains(k.type_id()),
    });
    match entry.as_ref() {
        &rule_graph::Entry::WithDeps(wd) => match wd.as_ref() {
            rule_graph::EntryWithDeps::Rule(ref rule_entry) => match rule_entry.rule() {
                Rule::Task(task) => {
                    context
                        .get(TaskNode {
                            params: params.clone(),
                            task: task.clone(),
                            entry,
                        })
                        .await
                }
                Rule::Intrinsic(intrinsic) => {
                    let values = futures::future::try_join_all(
                        intrinsic
                            .inputs
                            .iter()
                            .map(|dependency_key| {
                                select_product(
                                    context.clone(),
                                    params.clone(),
                                    dependency_key,
                                    "intrinsic",
                                    entry,
                                )
                            })
                            .collect::<Vec<_>>(),
                    )
                    .await?;
                    context
                        .core
                        .intrinsics
                        .run(intrinsic, context.clone(), values)
                        .await
                }
            },
            &rule_graph::EntryWithDeps::Root(_) => {
                panic!("Not a runtime-executable entry! {entry:?}")
            }
        },
        &rule_graph::Entry::Param(type_id) => {
            if let Some(key) = params.find(type_id) {
                Ok(key.to_value())
            } else {
                Err(throw(format!(
                    "Expected a Param of type {type_id} to be present, but had only: {params}",
                )))
            }
        }
    }
}

pub(crate) fn select_product<'a>(
    context: Context,
    params: Params,
    dependency_key: &'a DependencyKey<TypeId>,
    caller_description: &'a str,
    entry: Intern<rule_graph::Entry<Rule>>,
) -> BoxFuture<'a, NodeResult<Value>> {
    let edges = context
        .core
        .rule_graph
        .edges_for_inner(&entry)
        .ok_or_else(|| {
            throw(format!(
                "Tried to request {dependency_key} for {caller_description} but found no edges"
            ))
        });
    async move {
        let edges = edges?;
        let entry = edges.entry_for(dependency_key).unwrap_or_else(|| {
            panic!("{caller_description} did not declare a dependency on {dependency_key:?}")
        });
        select(context, params, entry.into()).await
    }
    .boxed()
}

///
/// There is large variance in the sizes of the members of this enum, so a few of them are
/// boxed.
///
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum NodeKey {
    DigestFile(DigestFile),
    ExecuteProcess(Box<ExecuteProcess>),
    ReadLink(ReadLink),
    Scandir(Scandir),
    Root(Box<Root>),
    Snapshot(SnapshotNode),
    Task(Box<TaskNode>),
}

impl NodeKey {
    pub fn fs_subject(&self) -> Option<&Path> {
        match self {
            NodeKey::DigestFile(s) => Some(s.0.path.as_path()),
            NodeKey::ReadLink(s) => Some(s.0.path.as_path()),
            NodeKey::Scandir(s) => Some(s.0 .0.as_path()),

            // Not FS operations:
            // Explicitly listed so that if people add new NodeKeys they need to consider
            // whether their NodeKey represents an FS operation, and accordingly whether they
            // need to add it to the above list or the below list.
            &NodeKey::ExecuteProcess { .. }
            | &NodeKey::Root { .. }
            | &NodeKey::Snapshot { .. }
            | &NodeKey::Task { .. } => None,
        }
    }

    fn workunit_level(&self) -> Level {
        match self {
            NodeKey::Task(ref task) => {
                if task.task.cacheable {
                    Level::Debug
                } else {
                    Level::Trace
                }
            }
            NodeKey::ExecuteProcess(ref process) => {
                // NB: The Node for a Process is the WorkunitStore's conception of the process:
                // the workunit for running it renders at the Process's level.
                process.process.level
            }
            _ => Level::Trace,
        }
    }

    fn workunit_name(&self) -> &'static str {
        match self {
            NodeKey::Task(..) => "rule",
            NodeKey::ExecuteProcess(..) => "process",
            NodeKey::Snapshot(..) => "snapshot",
            NodeKey::DigestFile(..) => "digest_file",
            NodeKey::ReadLink(..) => "read_link",
            NodeKey::Scandir(..) => "scandir",
            NodeKey::Root(..) => "root",
        }
    }
}

#[async_trait]
impl Node for NodeKey {
    type Context = SessionCore;

    type Item = NodeOutput;
    type Error = Failure;

    async fn run(self, context: graph::Context<NodeKey>) -> Result<NodeOutput, Failure> {
        let workunit_name = self.workunit_name();
        let workunit_level = self.workunit_level();
        let workunit_desc = match &self {
            NodeKey::ExecuteProcess(process) => Some(process.process.description.clone()),
            NodeKey::Task(task) => Some(task.task.id.clone()),
            _ => None,
        };

        workunit_store::in_workunit!(
            workunit_name,
            workunit_level,
            desc = workunit_desc,
            |workunit| async move {
                match self {
                    NodeKey::DigestFile(n) => n.run_node(context).await.map(NodeOutput::FileDigest),
                    NodeKey::ExecuteProcess(n) => n
                        .run_node(context, workunit)
                        .await
                        .map(|r| NodeOutput::ProcessResult(Box::new(r))),
                    NodeKey::ReadLink(n) => n.run_node(context).await.map(NodeOutput::LinkDest),
                    NodeKey::Scandir(n) => {
                        n.run_node(context).await.map(NodeOutput::DirectoryListing)
                    }
                    NodeKey::Root(n) => n.run_node(context).await.map(NodeOutput::Value),
                    NodeKey::Snapshot(n) => n.run_node(context).await.map(NodeOutput::Snapshot),
                    NodeKey::Task(n) => n.run_node(context).await.map(NodeOutput::Value),
                }
            }
        )
        .await
    }

    fn restartable(&self) -> bool {
        // A Node is restartable unless it has already side-effected: the only node kind with
        // side effects beyond the sandbox is a Process, which is itself idempotent.
        true
    }

    fn cacheable(&self) -> bool {
        match self {
            NodeKey::Task(task) => task.task.cacheable,
            NodeKey::ExecuteProcess(process) => {
                process.process.cache_scope != process_execution::ProcessCacheScope::PerSession
            }
            _ => true,
        }
    }

    fn cacheable_item(&self, output: &NodeOutput) -> bool {
        match (self, output) {
            (NodeKey::ExecuteProcess(ref process), NodeOutput::ProcessResult(ref result)) => {
                match process.process.cache_scope {
                    process_execution::ProcessCacheScope::Always
                    | process_execution::ProcessCacheScope::PerRestartAlways => true,
                    process_execution::ProcessCacheScope::Successful
                    | process_execution::ProcessCacheScope::PerRestartSuccessful => {
                        result.result.exit_code == 0
                    }
                    process_execution::ProcessCacheScope::PerSession => false,
                }
            }
            _ => true,
        }
    }

    fn cyclic_error(path: &[&NodeKey]) -> Failure {
        let path = path.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        throw(format!(
            "The dependency graph contained a cycle:\n  {}",
            path.join("\n  ")
        ))
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeKey::DigestFile(s) => write!(f, "DigestFile({})", s.0.path.display()),
            NodeKey::ExecuteProcess(s) => {
                write!(f, "Process({})", s.process.description)
            }
            NodeKey::ReadLink(s) => write!(f, "ReadLink({})", (s.0).path.display()),
            NodeKey::Scandir(s) => write!(f, "Scandir({})", (s.0).0.display()),
            NodeKey::Root(s) => write!(
                f,
                "Root({} for {})",
                s.product,
                display_sorted_in_parens(s.params.keys())
            ),
            NodeKey::Snapshot(s) => write!(f, "Snapshot({})", s.0),
            NodeKey::Task(task) => {
                write!(f, "@rule({})", task.task.id)
            }
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeOutput {
    FileDigest(hashing::Digest),
    Snapshot(store::Snapshot),
    DirectoryListing(Arc<DirectoryListing>),
    LinkDest(LinkDest),
    ProcessResult(Box<ProcessResult>),
    Value(Value),
}

impl NodeOutput {
    ///
    /// The digests which this output retains in memory (and thus leases in the store).
    ///
    pub fn digests(&self) -> Vec<hashing::Digest> {
        match self {
            NodeOutput::FileDigest(d) => vec![*d],
            NodeOutput::Snapshot(s) => s.directory_digest().digests(),
            NodeOutput::ProcessResult(p) => {
                let mut digests = p.result.output_directory.digests();
                digests.push(p.result.stdout_digest);
                digests.push(p.result.stderr_digest);
                digests
            }
            NodeOutput::DirectoryListing(_) | NodeOutput::LinkDest(_) | NodeOutput::Value(_) => {
                vec![]
            }
        }
    }
}

//
// TryFrom implementations to extract the typed output of each node kind: used by
// `graph::Context::get` via `CompoundNode`.
//

impl TryFrom<NodeOutput> for Value {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::Value(v) => Ok(v),
            _ => Err(()),
        }
    }
}

impl TryFrom<NodeOutput> for hashing::Digest {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::FileDigest(v) => Ok(v),
            _ => Err(()),
        }
    }
}

impl TryFrom<NodeOutput> for store::Snapshot {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::Snapshot(v) => Ok(v),
            _ => Err(()),
        }
    }
}

impl TryFrom<NodeOutput> for Arc<DirectoryListing> {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::DirectoryListing(v) => Ok(v),
            _ => Err(()),
        }
    }
}

impl TryFrom<NodeOutput> for LinkDest {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::LinkDest(v) => Ok(v),
            _ => Err(()),
        }
    }
}

impl TryFrom<NodeOutput> for ProcessResult {
    type Error = ();

    fn try_from(nr: NodeOutput) -> Result<Self, ()> {
        match nr {
            NodeOutput::ProcessResult(v) => Ok(*v),
            _ => Err(()),
        }
    }
}

//
// CompoundNode implementations for each node kind.
//

impl CompoundNode<NodeKey> for DigestFile {
    type Item = hashing::Digest;
}

impl From<DigestFile> for NodeKey {
    fn from(n: DigestFile) -> Self {
        NodeKey::DigestFile(n)
    }
}

impl CompoundNode<NodeKey> for ExecuteProcess {
    type Item = ProcessResult;
}

impl From<ExecuteProcess> for NodeKey {
    fn from(n: ExecuteProcess) -> Self {
        NodeKey::ExecuteProcess(Box::new(n))
    }
}

impl CompoundNode<NodeKey> for ReadLink {
    type Item = LinkDest;
}

impl From<ReadLink> for NodeKey {
    fn from(n: ReadLink) -> Self {
        NodeKey::ReadLink(n)
    }
}

impl CompoundNode<NodeKey> for Scandir {
    type Item = Arc<DirectoryListing>;
}

impl From<Scandir> for NodeKey {
    fn from(n: Scandir) -> Self {
        NodeKey::Scandir(n)
    }
}

impl CompoundNode<NodeKey> for SnapshotNode {
    type Item = store::Snapshot;
}

impl From<SnapshotNode> for NodeKey {
    fn from(n: SnapshotNode) -> Self {
        NodeKey::Snapshot(n)
    }
}

impl CompoundNode<NodeKey> for TaskNode {
    type Item = Value;
}

impl From<TaskNode> for NodeKey {
    fn from(n: TaskNode) -> Self {
        NodeKey::Task(Box::new(n))
    }
}

impl CompoundNode<NodeKey> for Root {
    type Item = Value;
}

impl From<Root> for NodeKey {
    fn from(n: Root) -> Self {
        NodeKey::Root(Box::new(n))
    }
}
