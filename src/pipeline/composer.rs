// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 seqflow contributors

//! Pipeline composition
//!
//! Pipelines are explicit trees: a stage, a sequence (`a + b`), or a
//! fan-out (`branches * segments`). Interpretation is a walk of the tree:
//! sequences thread each stage's onward inputs into the next, fan-outs
//! fork child pipelines that run concurrently and are merged back in when
//! every branch has finished.

use futures::future::BoxFuture;
use std::ops::{Add, Mul};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::errors::SeqflowResult;
use crate::pipeline::branch::{Pipeline, StageRecord};
use crate::pipeline::split::split_branches;
use crate::pipeline::stage::{run_stage, StageDef, StageRuntime};

/// One element of a composed pipeline expression
#[derive(Debug, Clone)]
pub enum Node {
    /// A single named stage
    Stage(StageDef),
    /// Sequential composition: run left, feed its results to right
    Seq(Box<Node>, Box<Node>),
    /// Fan out the segments over a set of branches
    Fanout(FanKeys, Vec<Node>),
}

/// How a fan-out derives its branches
#[derive(Debug, Clone)]
pub enum FanKeys {
    /// Explicit branch keys (chromosomes, samples, regions)
    Branches(Vec<String>),
    /// Group inputs by a `%`/`*` filename pattern
    Pattern(String),
}

impl From<StageDef> for Node {
    fn from(def: StageDef) -> Self {
        Node::Stage(def)
    }
}

impl Add for Node {
    type Output = Node;

    fn add(self, rhs: Node) -> Node {
        Node::Seq(Box::new(self), Box::new(rhs))
    }
}

/// Explicit fan-out keys, combined with segments via `*`.
#[derive(Debug, Clone)]
pub struct Branches(pub Vec<String>);

/// Build a branch set from any list of keys.
pub fn branches<I, S>(keys: I) -> Branches
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Branches(keys.into_iter().map(Into::into).collect())
}

/// A `%`/`*` filename pattern fan-out, combined with segments via `*`.
#[derive(Debug, Clone)]
pub struct SplitPattern(pub String);

/// Build a pattern splitter.
pub fn split_on(pattern: impl Into<String>) -> SplitPattern {
    SplitPattern(pattern.into())
}

impl Mul<Vec<Node>> for Branches {
    type Output = Node;

    fn mul(self, segments: Vec<Node>) -> Node {
        Node::Fanout(FanKeys::Branches(self.0), segments)
    }
}

impl Mul<Node> for Branches {
    type Output = Node;

    fn mul(self, segment: Node) -> Node {
        Node::Fanout(FanKeys::Branches(self.0), vec![segment])
    }
}

impl Mul<Vec<Node>> for SplitPattern {
    type Output = Node;

    fn mul(self, segments: Vec<Node>) -> Node {
        Node::Fanout(FanKeys::Pattern(self.0), segments)
    }
}

impl Mul<Node> for SplitPattern {
    type Output = Node;

    fn mul(self, segment: Node) -> Node {
        Node::Fanout(FanKeys::Pattern(self.0), vec![segment])
    }
}

/// Interprets a composed pipeline expression
pub struct Composer {
    runtime: Arc<StageRuntime>,
}

impl Composer {
    pub fn new(runtime: Arc<StageRuntime>) -> Self {
        Self { runtime }
    }

    /// Run a whole expression against the given inputs, returning the
    /// completed root pipeline.
    pub async fn run(
        &self,
        root: &Node,
        name: &str,
        inputs: Vec<String>,
    ) -> SeqflowResult<Pipeline> {
        let mut pipeline = Pipeline::root(name);
        self.walk(root, &mut pipeline, inputs).await?;
        Ok(pipeline)
    }

    /// Walk one node, returning what flows onward from it.
    pub(crate) fn walk<'a>(
        &'a self,
        node: &'a Node,
        pipeline: &'a mut Pipeline,
        inputs: Vec<String>,
    ) -> BoxFuture<'a, SeqflowResult<Vec<String>>> {
        Box::pin(async move {
            match node {
                Node::Stage(def) => {
                    let record = run_stage(def, &self.runtime, &pipeline.branch, inputs).await?;
                    let next = record.next_or_output();
                    pipeline.stages.push(record);
                    Ok(next)
                }
                Node::Seq(a, b) => {
                    let mid = self.walk(a, pipeline, inputs).await?;
                    self.walk(b, pipeline, mid).await
                }
                Node::Fanout(keys, segments) => {
                    self.fan_out(keys, segments, pipeline, inputs).await
                }
            }
        })
    }

    /// Fork one child pipeline per (branch, segment), run them all
    /// concurrently, then merge the results into the parent.
    async fn fan_out(
        &self,
        keys: &FanKeys,
        segments: &[Node],
        pipeline: &mut Pipeline,
        inputs: Vec<String>,
    ) -> SeqflowResult<Vec<String>> {
        let branch_inputs: Vec<(String, Vec<String>)> = match keys {
            FanKeys::Branches(list) => {
                list.iter().map(|k| (k.clone(), inputs.clone())).collect()
            }
            FanKeys::Pattern(pattern) => {
                let history: Vec<Vec<String>> = pipeline
                    .stages
                    .iter()
                    .rev()
                    .map(|s| s.input.clone())
                    .collect();
                split_branches(pattern, &inputs, &history)?
                    .into_iter()
                    .collect()
            }
        };

        debug!(
            branches = branch_inputs.len(),
            segments = segments.len(),
            "fanning out"
        );

        let mut join_set: JoinSet<(String, usize, Pipeline)> = JoinSet::new();

        for (key, branch_in) in &branch_inputs {
            for (seg_idx, segment) in segments.iter().enumerate() {
                let mut child = pipeline.fork(key);
                child
                    .stages
                    .push(StageRecord::prior(&child.branch, branch_in.clone()));

                let runtime = self.runtime.clone();
                let segment = segment.clone();
                let branch_in = branch_in.clone();
                let key = key.clone();

                join_set.spawn(async move {
                    let composer = Composer::new(runtime);
                    if let Err(e) = composer.walk(&segment, &mut child, branch_in).await {
                        child.record_failure(e.to_string());
                    }
                    (key, seg_idx, child)
                });
            }
        }

        let mut finished: Vec<(String, usize, Pipeline)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(item) => finished.push(item),
                Err(e) => {
                    // A panicking branch still participates in failure
                    // aggregation
                    let mut crashed = Pipeline::default();
                    crashed.record_failure(format!("branch task aborted: {}", e));
                    finished.push((String::new(), usize::MAX, crashed));
                }
            }
        }

        finished.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        pipeline
            .children
            .extend(finished.into_iter().map(|(_, _, child)| child));

        pipeline.merge_children()
    }
}
