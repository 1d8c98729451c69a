use std::sync::Arc;

use nalgebra::DVector;
use tracing::{
    debug,
    warn
};

use super::conditioning::{
    ConditioningMode,
    conditioning_density
};
use super::nodelikelihood::{
    bifurcation_likelihood,
    leaf_likelihood,
    sampled_ancestor_likelihood,
    sampling_event
};
use crate::configuration::LikelihoodConfiguration;
use crate::flow::extinctionprobabilities::ExtinctionProbabilities;
use crate::flow::flow::Flow;
use crate::flow::flowcache::{
    CacheBackend,
    FlowCache,
    RefCellBackend,
    RwLockBackend
};
use crate::likelihooderror::{
    LikelihoodError,
    LikelihoodResult
};
use crate::math::rescale::rescale;
use crate::math::special::{
    TIME_TOLERANCE,
    ln_factorial
};
use crate::parameterization::parameterization::Parameterization;
use crate::tree::tree::{
    NodeKind,
    Tree
};

// ─────────────────────────────────────────────────────────────────────────────
// TreeSetup
// ─────────────────────────────────────────────────────────────────────────────

/// 建構時一次完成的檢查結果：root 頻率與每個取樣節點的 type。
#[derive(Clone, Debug)]
pub(crate) struct TreeSetup {
    pub frequencies: Vec<f64>,
    pub node_types: Vec<Option<usize>>,
}

impl TreeSetup {
    pub fn new(
        parameterization: &dyn Parameterization,
        tree: &Tree,
        config: &LikelihoodConfiguration,
    ) -> LikelihoodResult<TreeSetup> {
        config.validate_tolerances()?;
        if !tree.is_binary() {
            return Err(LikelihoodError::configuration("tree must be binary"));
        }
        if let Some(node) = (0..tree.node_count()).map(|i| tree.node(i)).find(|node| node.branch_length() < 0.0) {
            return Err(LikelihoodError::configuration(format!(
                "node {} has a negative branch length {}",
                node.label().unwrap_or("<unnamed>"),
                node.branch_length()
            )));
        }

        let n = parameterization.type_count();
        let frequencies = config.resolve_frequencies(n)?;
        let node_types = read_node_types(tree, n, config.type_label.as_deref())?;

        let root_time = parameterization.node_time(tree.height(tree.root()), config.final_sample_offset);
        if root_time < -TIME_TOLERANCE {
            return Err(LikelihoodError::configuration(format!(
                "tree root lies before the start of the process (t = {root_time})"
            )));
        }
        if config.conditioning == ConditioningMode::RootAge && root_time.abs() > TIME_TOLERANCE {
            return Err(LikelihoodError::configuration(format!(
                "root-age conditioning requires the root at the process start, found t = {root_time}"
            )));
        }

        Ok(TreeSetup { frequencies, node_types })
    }
}

fn is_sample(tree: &Tree, index: usize) -> bool {
    match tree.kind(index) {
        NodeKind::Leaf | NodeKind::DirectAncestorLeaf => true,
        NodeKind::SampledAncestor { sample, .. } => sample == index,
        NodeKind::Bifurcation { .. } => false,
    }
}

fn read_node_types(tree: &Tree, type_count: usize, type_label: Option<&str>) -> LikelihoodResult<Vec<Option<usize>>> {
    if type_count > 1 && type_label.is_none() {
        return Err(LikelihoodError::configuration(format!(
            "a type label is required for a model with {type_count} types"
        )));
    }

    let mut node_types = vec![None; tree.node_count()];
    for index in (0..tree.node_count()).filter(|i| is_sample(tree, *i)) {
        let node = tree.node(index);
        let name = node.label().unwrap_or("<unnamed>");
        let raw = type_label.and_then(|label| node.metadata(label));
        let type_index = match raw {
            Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
                LikelihoodError::configuration(format!("node {name} has a non-integer type '{raw}'"))
            })?,
            None if type_count == 1 => 0,
            None => {
                return Err(LikelihoodError::configuration(format!("node {name} has no type annotation")));
            }
        };
        if type_index >= type_count {
            return Err(LikelihoodError::configuration(format!(
                "node {name} has type {type_index} but the model has {type_count} types"
            )));
        }
        node_types[index] = Some(type_index);
    }
    Ok(node_types)
}

// ─────────────────────────────────────────────────────────────────────────────
// Traversal
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub(crate) struct NodeState {
    pub likelihood: DVector<f64>,
    pub log_scale: f64,
}

/// 沿 edge 把 likelihood 向量由 `t_bottom` 往上移到 `t_top`。
///
/// `t_top` 落在 rho 邊界 τ 上時，`after_side = false` 取 τ⁻（已含 rho 修正），
/// `true` 取 τ⁺。
pub(crate) trait EdgePropagator: Sync {
    fn propagate(
        &self,
        t_top: f64,
        t_bottom: f64,
        likelihood: &DVector<f64>,
        after_side: bool,
    ) -> LikelihoodResult<DVector<f64>>;
}

impl EdgePropagator for Flow {
    fn propagate(
        &self,
        t_top: f64,
        t_bottom: f64,
        likelihood: &DVector<f64>,
        after_side: bool,
    ) -> LikelihoodResult<DVector<f64>> {
        self.transport(t_top, after_side, t_bottom, likelihood)
    }
}

/// 單次 post-order 計算所需的唯讀資料；只持有參照，可跨執行緒共享。
pub(crate) struct Traversal<'a> {
    pub parameterization: &'a dyn Parameterization,
    pub tree: &'a Tree,
    pub extinction: &'a ExtinctionProbabilities,
    pub propagator: &'a dyn EdgePropagator,
    pub node_types: &'a [Option<usize>],
    pub subtree_sizes: &'a [usize],
    pub final_sample_offset: f64,
    pub parallel_threshold: Option<usize>,
}

impl Traversal<'_> {
    fn node_time(&self, index: usize) -> f64 {
        self.parameterization.node_time(self.tree.height(index), self.final_sample_offset)
    }

    fn node_type(&self, index: usize) -> LikelihoodResult<usize> {
        self.node_types[index].ok_or_else(|| {
            LikelihoodError::configuration(format!("node {index} is not a sample and carries no type"))
        })
    }

    /// 節點本身（其 parent edge 下端）的已縮放 likelihood 向量。
    pub fn at_node(&self, index: usize) -> LikelihoodResult<NodeState> {
        let p = self.parameterization;
        let t = self.node_time(index);

        let (likelihood, previous_scale) = match self.tree.kind(index) {
            NodeKind::Leaf | NodeKind::DirectAncestorLeaf => {
                let type_index = self.node_type(index)?;
                let event = sampling_event(p, t, type_index);
                (leaf_likelihood(p, self.extinction, event, type_index, t), 0.0)
            }
            NodeKind::SampledAncestor { child, sample } => {
                let type_index = self.node_type(sample)?;
                let event = sampling_event(p, t, type_index);
                let child_state = self.at_node(child)?;
                let propagated = self.propagator.propagate(
                    t,
                    self.node_time(child),
                    &child_state.likelihood,
                    event.is_rho(),
                )?;
                (
                    sampled_ancestor_likelihood(p, event, type_index, &propagated),
                    child_state.log_scale,
                )
            }
            NodeKind::Bifurcation { left, right } => {
                let (left_state, right_state) = match self.parallel_threshold {
                    Some(threshold) if self.subtree_sizes[index] >= threshold => {
                        rayon::join(|| self.edge_top(left, t), || self.edge_top(right, t))
                    }
                    _ => (self.edge_top(left, t), self.edge_top(right, t)),
                };
                let (left_state, right_state) = (left_state?, right_state?);
                let interval = p.interval_index(t);
                (
                    bifurcation_likelihood(p, interval, &left_state.likelihood, &right_state.likelihood),
                    left_state.log_scale + right_state.log_scale,
                )
            }
        };

        let (likelihood, log_scale) = rescale(likelihood, previous_scale);
        Ok(NodeState { likelihood, log_scale })
    }

    /// 節點向量沿 parent edge 移到時間 `t_top`。
    pub fn edge_top(&self, index: usize, t_top: f64) -> LikelihoodResult<NodeState> {
        let state = self.at_node(index)?;
        let likelihood = self
            .propagator
            .propagate(t_top, self.node_time(index), &state.likelihood, false)?;
        Ok(NodeState { likelihood, log_scale: state.log_scale })
    }

    /// 整棵樹的 log-likelihood：root 向量（除 root-age 外先移到 t = 0）以頻率加權、
    /// 除以條件化分母，再加回 scale factor 與 labelled-tree 修正
    /// `ln 2·#bifurcations − ln(#samples!)`。
    pub fn log_likelihood(&self, config: &LikelihoodConfiguration, frequencies: &[f64]) -> LikelihoodResult<f64> {
        let root = self.tree.root();
        let root_state = if config.conditioning == ConditioningMode::RootAge {
            self.at_node(root)?
        } else {
            self.edge_top(root, 0.0)?
        };

        let weighted: f64 = frequencies.iter().zip(root_state.likelihood.iter()).map(|(f, g)| f * g).sum();
        if weighted <= 0.0 {
            debug!(weighted, "root likelihood is not positive");
            return Ok(f64::NEG_INFINITY);
        }
        let density = conditioning_density(
            config.conditioning,
            self.parameterization,
            frequencies,
            &self.extinction.at_origin(),
        );
        if !(density.is_finite() && density > 0.0) {
            return Err(LikelihoodError::degeneracy(format!(
                "conditioning density must be positive, got {density}"
            )));
        }

        let labelled_correction =
            std::f64::consts::LN_2 * self.tree.bifurcation_count() as f64 - ln_factorial(self.tree.sample_count());
        Ok((weighted / density).ln() + root_state.log_scale + labelled_correction)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BirthDeathMigrationDistribution
// ─────────────────────────────────────────────────────────────────────────────

/// 以 flow 法計算的多型 birth-death-migration 樹 likelihood。
///
/// 與樹無關的 extinction probability 與 flow 由 [`FlowCache`] 依參數物件快取；
/// 換參數時以 [`set_parameterization`](Self::set_parameterization) 傳入新的 `Arc`。
pub struct BirthDeathMigrationDistribution<C: CacheBackend = RefCellBackend> {
    parameterization: Arc<dyn Parameterization>,
    tree: Arc<Tree>,
    config: LikelihoodConfiguration,
    setup: TreeSetup,
    subtree_sizes: Vec<usize>,
    cache: FlowCache<C>,
}

impl BirthDeathMigrationDistribution<RefCellBackend> {
    pub fn new(
        parameterization: Arc<dyn Parameterization>,
        tree: Arc<Tree>,
        config: LikelihoodConfiguration,
    ) -> LikelihoodResult<Self> {
        Self::with_cache(parameterization, tree, config, FlowCache::new())
    }
}

impl BirthDeathMigrationDistribution<RwLockBackend> {
    pub fn new_threadsafe(
        parameterization: Arc<dyn Parameterization>,
        tree: Arc<Tree>,
        config: LikelihoodConfiguration,
    ) -> LikelihoodResult<Self> {
        Self::with_cache(parameterization, tree, config, FlowCache::new_threadsafe())
    }
}

impl<C: CacheBackend> BirthDeathMigrationDistribution<C> {
    pub fn with_cache(
        parameterization: Arc<dyn Parameterization>,
        tree: Arc<Tree>,
        config: LikelihoodConfiguration,
        cache: FlowCache<C>,
    ) -> LikelihoodResult<Self> {
        let setup = TreeSetup::new(parameterization.as_ref(), &tree, &config)?;
        let subtree_sizes = tree.subtree_sizes();
        debug!(
            samples = tree.sample_count(),
            direct_ancestors = tree.direct_ancestor_count(),
            types = parameterization.type_count(),
            "tree accepted"
        );
        Ok(BirthDeathMigrationDistribution { parameterization, tree, config, setup, subtree_sizes, cache })
    }

    pub fn parameterization(&self) -> &Arc<dyn Parameterization> {
        &self.parameterization
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn configuration(&self) -> &LikelihoodConfiguration {
        &self.config
    }

    /// 換上新的參數；檢查失敗時保留原本的參數。
    pub fn set_parameterization(&mut self, parameterization: Arc<dyn Parameterization>) -> LikelihoodResult<()> {
        self.setup = TreeSetup::new(parameterization.as_ref(), &self.tree, &self.config)?;
        self.parameterization = parameterization;
        Ok(())
    }

    pub fn log_likelihood(&self) -> LikelihoodResult<f64> {
        let precomputed = self.cache.get_or_compute(&self.parameterization, &self.config)?;
        let traversal = Traversal {
            parameterization: self.parameterization.as_ref(),
            tree: &self.tree,
            extinction: &precomputed.extinction,
            propagator: &precomputed.flow,
            node_types: &self.setup.node_types,
            subtree_sizes: &self.subtree_sizes,
            final_sample_offset: self.config.final_sample_offset,
            parallel_threshold: self.config.parallel_subtree_threshold,
        };

        let log_likelihood = traversal.log_likelihood(&self.config, &self.setup.frequencies)?;
        debug!(log_likelihood, "tree likelihood evaluated");
        Ok(log_likelihood)
    }

    /// sampler 用的介面：任何計算失敗都回傳 `-inf`。
    pub fn calculate_log_p(&self) -> f64 {
        match self.log_likelihood() {
            Ok(log_p) => log_p,
            Err(error) => {
                warn!(%error, "likelihood evaluation rejected");
                f64::NEG_INFINITY
            }
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
