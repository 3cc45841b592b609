use burn::module::{Module, ModuleVisitor, Param, ParamId};
use burn::prelude::*;
use std::collections::HashSet;
use std::marker::PhantomData;

/// Identities of every float tensor owned by one sub-network.
#[derive(Clone, Debug)]
pub struct ParamGroup {
    name: &'static str,
    ids: Vec<ParamId>,
}

struct ParamCollector<'a, B: Backend> {
    ids: &'a mut Vec<ParamId>,
    _phantom: PhantomData<B>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<'_, B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.ids.push(param.id);
    }
}

impl ParamGroup {
    /// Walk `module` and record the id of each parameter it owns.
    pub fn collect<B: Backend, M: Module<B>>(name: &'static str, module: &M) -> Self {
        let mut ids = Vec::new();
        let mut collector = ParamCollector::<B> {
            ids: &mut ids,
            _phantom: PhantomData,
        };
        module.visit(&mut collector);
        Self { name, ids }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ids(&self) -> &[ParamId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &ParamId) -> bool {
        self.ids.contains(id)
    }

    /// True when no parameter belongs to both groups.
    pub fn is_disjoint(&self, other: &ParamGroup) -> bool {
        let mine: HashSet<&ParamId> = self.ids.iter().collect();
        other.ids.iter().all(|id| !mine.contains(id))
    }
}
