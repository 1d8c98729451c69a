// ── flowcache.rs ───────────────────────────────────────────────────────────

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{
    Arc,
    RwLock
};

use nalgebra::DMatrix;

use super::extinctionprobabilities::ExtinctionProbabilities;
use super::extinctionsystem::ExtinctionOdeSystem;
use super::flow::{
    Flow,
    FlowDirection
};
use super::flowsystem::FlowOdeSystem;
use crate::configuration::LikelihoodConfiguration;
use crate::likelihooderror::LikelihoodResult;
use crate::parameterization::parameterization::Parameterization;

// ─────────────────────────────────────────────────────────────────────────────
// PrecomputedFlow
// ─────────────────────────────────────────────────────────────────────────────

/// 一組參數下、與樹無關的預先計算結果。
#[derive(Clone, Debug)]
pub struct PrecomputedFlow {
    pub extinction: ExtinctionProbabilities,
    pub flow: Flow,
}

impl PrecomputedFlow {
    pub fn compute(
        parameterization: &dyn Parameterization,
        config: &LikelihoodConfiguration,
    ) -> LikelihoodResult<PrecomputedFlow> {
        let extinction = ExtinctionOdeSystem::new(parameterization).integrate_from_present(config)?;
        let n = parameterization.type_count();
        let flow = FlowOdeSystem::new(parameterization, &extinction).integrate(
            &DMatrix::identity(n, n),
            config.flow_direction,
            config,
        )?;
        Ok(PrecomputedFlow { extinction, flow })
    }
}

/// 影響積分結果的數值設定，作為快取 key 的一部分。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    absolute_tolerance: u64,
    relative_tolerance: u64,
    max_steps: usize,
    direction: FlowDirection,
}

impl FlowKey {
    pub fn new(config: &LikelihoodConfiguration) -> FlowKey {
        FlowKey {
            absolute_tolerance: config.absolute_tolerance.to_bits(),
            relative_tolerance: config.relative_tolerance.to_bits(),
            max_steps: config.max_steps,
            direction: config.flow_direction,
        }
    }
}

/// 抽象快取行為：pointer-identity 失效檢查 + 查詢 + 計算並存入。
///
/// 身份以 `Arc::as_ptr(&parameterization)` 判斷；快取同時持有該 `Arc`，
/// 因此在快取有效期間位址不會被其他物件重用。計算失敗時不寫入。
pub trait CacheBackend {
    fn get_or_compute(
        &self,
        parameterization: &Arc<dyn Parameterization>,
        key: FlowKey,
        compute: impl FnOnce() -> LikelihoodResult<PrecomputedFlow>,
    ) -> LikelihoodResult<Arc<PrecomputedFlow>>;

    fn clear(&self);
}

fn identity(parameterization: &Arc<dyn Parameterization>) -> usize {
    Arc::as_ptr(parameterization) as *const () as usize
}

// ── 單執行緒版：RefCell ──────────────────────────────────────────────────────

#[derive(Default)]
struct CacheInner {
    owner: Option<(usize, Arc<dyn Parameterization>)>,
    cache: HashMap<FlowKey, Arc<PrecomputedFlow>>,
}

impl CacheInner {
    fn invalidate_unless(&mut self, parameterization: &Arc<dyn Parameterization>) {
        let id = identity(parameterization);
        if self.owner.as_ref().map(|(owner, _)| *owner) != Some(id) {
            self.cache.clear();
            self.owner = Some((id, Arc::clone(parameterization)));
        }
    }
}

#[derive(Default)]
pub struct RefCellBackend {
    inner: RefCell<CacheInner>,
}

impl RefCellBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for RefCellBackend {
    fn get_or_compute(
        &self,
        parameterization: &Arc<dyn Parameterization>,
        key: FlowKey,
        compute: impl FnOnce() -> LikelihoodResult<PrecomputedFlow>,
    ) -> LikelihoodResult<Arc<PrecomputedFlow>> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.invalidate_unless(parameterization);
            if let Some(hit) = inner.cache.get(&key) {
                return Ok(Arc::clone(hit));
            }
        }

        let computed = Arc::new(compute()?);
        self.inner.borrow_mut().cache.insert(key, Arc::clone(&computed));
        Ok(computed)
    }

    fn clear(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.cache.clear();
        inner.owner = None;
    }
}

// ── 多執行緒版：RwLock ───────────────────────────────────────────────────────
//
// 讀鎖查詢與寫鎖寫入之間，兩條執行緒可能都未命中而各自計算；同一組參數的結果
// 具確定性，重複計算只是浪費。

#[derive(Default)]
pub struct RwLockBackend {
    inner: RwLock<CacheInner>,
}

impl RwLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for RwLockBackend {
    fn get_or_compute(
        &self,
        parameterization: &Arc<dyn Parameterization>,
        key: FlowKey,
        compute: impl FnOnce() -> LikelihoodResult<PrecomputedFlow>,
    ) -> LikelihoodResult<Arc<PrecomputedFlow>> {
        let id = identity(parameterization);
        {
            let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            let current = inner.owner.as_ref().map(|(owner, _)| *owner) == Some(id);
            if current {
                if let Some(hit) = inner.cache.get(&key) {
                    return Ok(Arc::clone(hit));
                }
            }
        }

        let computed = Arc::new(compute()?);
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.invalidate_unless(parameterization);
        inner.cache.insert(key, Arc::clone(&computed));
        Ok(computed)
    }

    fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.cache.clear();
        inner.owner = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FlowCache
// ─────────────────────────────────────────────────────────────────────────────

/// 核心 struct 只寫一次，C 決定執行緒安全性。
pub struct FlowCache<C: CacheBackend> {
    backend: C,
}

impl FlowCache<RefCellBackend> {
    pub fn new() -> Self {
        FlowCache { backend: RefCellBackend::new() }
    }
}

impl FlowCache<RwLockBackend> {
    pub fn new_threadsafe() -> Self {
        FlowCache { backend: RwLockBackend::new() }
    }
}

impl<C: CacheBackend> FlowCache<C> {
    pub fn with_backend(backend: C) -> Self {
        FlowCache { backend }
    }

    pub fn get_or_compute(
        &self,
        parameterization: &Arc<dyn Parameterization>,
        config: &LikelihoodConfiguration,
    ) -> LikelihoodResult<Arc<PrecomputedFlow>> {
        self.backend.get_or_compute(parameterization, FlowKey::new(config), || {
            PrecomputedFlow::compute(parameterization.as_ref(), config)
        })
    }

    pub fn clear(&self) {
        self.backend.clear();
    }
}

// ── Type alias：對外只暴露這兩個名字 ─────────────────────────────────────────

pub type SingleThreadedFlowCache = FlowCache<RefCellBackend>;
pub type MultiThreadedFlowCache = FlowCache<RwLockBackend>;
