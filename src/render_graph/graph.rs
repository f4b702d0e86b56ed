//! Frame plan definition and validation

use std::collections::{HashMap, HashSet};

use crate::render_graph::pass::*;
use crate::render_graph::resource::*;

/// Ordering errors found by [`FramePlan::validate`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("pass {pass:?} reads {resource:?} before any pass writes it")]
    ReadBeforeWrite {
        pass: PassKind,
        resource: FrameResource,
    },
    #[error("pass {0:?} appears more than once")]
    DuplicatePass(PassKind),
}

/// Ordered list of passes executed for a view
#[derive(Debug, Clone, Default)]
pub struct FramePlan {
    nodes: Vec<PassNode>,
}

impl FramePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixed driver order
    pub fn standard() -> Self {
        PassKind::ALL.iter().fold(Self::new(), |plan, kind| plan.with(*kind))
    }

    pub fn with(mut self, kind: PassKind) -> Self {
        self.push(kind);
        self
    }

    pub fn push(&mut self, kind: PassKind) {
        self.nodes.push(PassNode::new(kind));
    }

    /// Remove a pass from the plan
    pub fn without(mut self, kind: PassKind) -> Self {
        self.nodes.retain(|n| n.kind != kind);
        self
    }

    pub fn contains(&self, kind: PassKind) -> bool {
        self.nodes.iter().any(|n| n.kind == kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = PassKind> + '_ {
        self.nodes.iter().map(|n| n.kind)
    }

    pub fn nodes(&self) -> &[PassNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that every per-frame resource read is preceded by a write.
    /// Persistent resources may be read before the frame writes them.
    pub fn validate(&self) -> Result<CompiledPlan, PlanError> {
        let mut seen = HashSet::new();
        let mut written = HashSet::new();

        for node in &self.nodes {
            if !seen.insert(node.kind) {
                return Err(PlanError::DuplicatePass(node.kind));
            }
            for input in &node.inputs {
                let resource = input.resource;
                if !resource.is_persistent() && !written.contains(&resource) {
                    return Err(PlanError::ReadBeforeWrite {
                        pass: node.kind,
                        resource,
                    });
                }
            }
            written.extend(node.outputs.iter().map(|a| a.resource));
        }

        Ok(self.compile())
    }

    fn compile(&self) -> CompiledPlan {
        let mut resource_lifetimes: HashMap<FrameResource, ResourceLifetime> = HashMap::new();

        for (order, node) in self.nodes.iter().enumerate() {
            for access in node.inputs.iter().chain(node.outputs.iter()) {
                let lifetime = resource_lifetimes
                    .entry(access.resource)
                    .or_insert(ResourceLifetime {
                        first_use: order,
                        last_use: order,
                    });
                lifetime.last_use = order;
            }
        }

        CompiledPlan {
            pass_order: self.kinds().collect(),
            resource_lifetimes,
        }
    }
}

/// Resource lifetime in terms of pass execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLifetime {
    pub first_use: usize,
    pub last_use: usize,
}

/// Validated plan with execution order and resource lifetimes
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub pass_order: Vec<PassKind>,
    pub resource_lifetimes: HashMap<FrameResource, ResourceLifetime>,
}

impl CompiledPlan {
    /// Check if a resource is alive at a given execution step
    pub fn is_resource_alive(&self, resource: FrameResource, step: usize) -> bool {
        if let Some(lifetime) = self.resource_lifetimes.get(&resource) {
            step >= lifetime.first_use && step <= lifetime.last_use
        } else {
            false
        }
    }

    /// Index of a pass in execution order
    pub fn step_of(&self, kind: PassKind) -> Option<usize> {
        self.pass_order.iter().position(|k| *k == kind)
    }
}
