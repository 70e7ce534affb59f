//! Arena of lens model instances.
//!
//! Consumers hold indices into the table rather than owning models, so a
//! lens node shared by several cameras resolves to one instance per frame
//! and an edit to it is observed by every consumer.

use crate::error::{CamSolveError, CamSolveResult};

use super::LensModel;

/// One model instance plus the index of its upstream input model.
#[derive(Debug, Clone, PartialEq)]
pub struct LensModelNode {
    pub model: LensModel,
    pub input: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct LensModelTable {
    nodes: Vec<LensModelNode>,
}

impl LensModelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a model with no input and return its index.
    pub fn push(&mut self, model: LensModel) -> usize {
        self.nodes.push(LensModelNode { model, input: None });
        self.nodes.len() - 1
    }

    /// Append an independent copy of `index`.
    ///
    /// The copy keeps the same input index; the source node is not touched.
    pub fn clone_node(&mut self, index: usize) -> CamSolveResult<usize> {
        let node = self.get(index)?.clone();
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    pub fn node(&self, index: usize) -> Option<&LensModelNode> {
        self.nodes.get(index)
    }

    pub fn model(&self, index: usize) -> Option<&LensModel> {
        self.nodes.get(index).map(|n| &n.model)
    }

    pub fn model_mut(&mut self, index: usize) -> Option<&mut LensModel> {
        self.nodes.get_mut(index).map(|n| &mut n.model)
    }

    fn get(&self, index: usize) -> CamSolveResult<&LensModelNode> {
        self.nodes.get(index).ok_or_else(|| {
            CamSolveError::Topology(format!(
                "Lens model index {index} out of range ({} models)",
                self.nodes.len()
            ))
        })
    }

    /// Wire `input` as the upstream model of `index`.
    ///
    /// Links that would close a cycle are refused.
    pub fn set_input(&mut self, index: usize, input: Option<usize>) -> CamSolveResult<()> {
        self.get(index)?;
        if let Some(upstream) = input {
            self.get(upstream)?;
            if self.chain(upstream).contains(&index) {
                return Err(CamSolveError::Topology(format!(
                    "Linking lens model {index} to input {upstream} creates a cycle"
                )));
            }
        }
        self.nodes[index].input = input;
        Ok(())
    }

    /// Indices of the chain ending at `index`, most upstream first.
    pub fn chain(&self, index: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut current = Some(index);
        while let Some(i) = current {
            if chain.len() > self.nodes.len() || chain.contains(&i) {
                break;
            }
            let Some(node) = self.nodes.get(i) else {
                break;
            };
            chain.push(i);
            current = node.input;
        }
        chain.reverse();
        chain
    }

    /// Apply the distortion of the chain ending at `index`, input models first.
    pub fn distort(&self, index: usize, x: f64, y: f64) -> (f64, f64) {
        self.chain(index)
            .into_iter()
            .fold((x, y), |(px, py), i| self.nodes[i].model.distort_point(px, py))
    }

    /// Apply the undistortion of the chain ending at `index`, input models first.
    pub fn undistort(&self, index: usize, x: f64, y: f64) -> (f64, f64) {
        self.chain(index)
            .into_iter()
            .fold((x, y), |(px, py), i| self.nodes[i].model.undistort_point(px, py))
    }
}
