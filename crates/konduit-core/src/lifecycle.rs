//! Closed/Open 生命周期状态机。
//!
//! # 设计背景（Why）
//! - 写入、链路装配与拆除必须互斥且遵循固定顺序：只能在 Closed→Open 时装配，只能在 Open→Closed 时拆除，
//!   只能在 Open 时写入；
//! - 真实多线程运行时下 `use/open/close` 可能被并发调用，因此所有状态变更都经过同一把锁串行化，
//!   等价于单线程协作调度下的原始不变量。
//!
//! # 逻辑解析（How）
//! - [`LifecycleController`] 以 `parking_lot::Mutex` 持有 [`ReadyState`] 与 [`ValveChain`]；
//! - [`GenerationClock`] 在每次 open 与 close 时自增；链路中的 Activity 与 [`Emitter`](crate::valve::Emitter)
//!   记录各自的代际，代际落后即判定过期。
//!
//! # 契约说明（What）
//! - 不存在中间态：装配在 `open()` 内同步完成（仅派生任务，不等待任务启动）；
//! - 锁内不执行任何 `.await`。

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::{
    chain::{ChainDeps, ValveChain},
    error::PipelineError,
    output::OutputHub,
    valve::{Tagged, Transform},
};

/// 管线就绪状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReadyState {
    #[default]
    Closed,
    Open,
}

/// open/close 代际时钟。
#[derive(Clone, Debug)]
pub(crate) struct GenerationClock {
    tx: Arc<watch::Sender<u64>>,
}

impl GenerationClock {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    pub(crate) fn advance(&self) -> u64 {
        self.tx.send_modify(|generation| *generation += 1);
        self.current()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// `close()` 的拆除结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Detached {
    pub(crate) links: usize,
    pub(crate) listeners: usize,
}

struct LifecycleState {
    ready: ReadyState,
    chain: ValveChain,
}

/// 生命周期协调者：串行化 `use/open/close`，并为写路径提供守卫。
pub(crate) struct LifecycleController {
    state: Mutex<LifecycleState>,
    clock: GenerationClock,
}

impl LifecycleController {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState {
                ready: ReadyState::Closed,
                chain: ValveChain::new(),
            }),
            clock: GenerationClock::new(),
        }
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        self.state.lock().ready
    }

    pub(crate) fn generation(&self) -> u64 {
        self.clock.current()
    }

    pub(crate) fn stage_count(&self) -> usize {
        self.state.lock().chain.len()
    }

    pub(crate) fn link_count(&self) -> usize {
        self.state.lock().chain.link_count()
    }

    pub(crate) fn labels(&self) -> Vec<String> {
        self.state.lock().chain.labels()
    }

    /// 追加 Stage；Open 期间链路已封存，返回 [`PipelineError::AlreadyOpen`]。
    pub(crate) fn register(&self, transform: Arc<dyn Transform>) -> Result<usize, PipelineError> {
        let mut state = self.state.lock();
        if state.ready == ReadyState::Open {
            return Err(PipelineError::AlreadyOpen);
        }
        Ok(state.chain.register(transform))
    }

    /// Closed→Open：校验、推进代际并装配链路，返回已装配的 Stage 数量。
    pub(crate) fn open(&self, deps: ChainDeps) -> Result<usize, PipelineError> {
        let mut state = self.state.lock();
        if state.ready == ReadyState::Open {
            return Err(PipelineError::AlreadyOpen);
        }
        if state.chain.is_empty() {
            return Err(PipelineError::EmptyChain);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| PipelineError::RuntimeUnavailable)?;

        let generation = self.clock.advance();
        state.chain.wire(&runtime, deps, self.clock.clone(), generation);
        state.ready = ReadyState::Open;
        Ok(state.chain.len())
    }

    /// Open→Closed：推进代际使在途 Activity 全部过期，拆除链路并移除输出侧监听者。
    pub(crate) fn close(&self, output: &OutputHub) -> Result<Detached, PipelineError> {
        let mut state = self.state.lock();
        if state.ready == ReadyState::Closed {
            return Err(PipelineError::AlreadyClosed);
        }

        self.clock.advance();
        let links = state.chain.teardown();
        let listeners = output.clear();
        state.ready = ReadyState::Closed;
        Ok(Detached { links, listeners })
    }

    /// 写入守卫：Closed 时返回 [`PipelineError::ClosedPipeline`]，否则返回链首与当前代际。
    pub(crate) fn assert_open_for_write(
        &self,
    ) -> Result<(mpsc::Sender<Tagged>, u64), PipelineError> {
        let state = self.state.lock();
        if state.ready == ReadyState::Closed {
            return Err(PipelineError::ClosedPipeline);
        }
        state.chain.head().ok_or(PipelineError::ClosedPipeline)
    }
}
