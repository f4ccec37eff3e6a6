//! ValveChain：有序的 Stage 序列及其装配逻辑。
//!
//! # 设计背景（Why）
//! - Stage *i* 的输出必须按注册顺序接到 Stage *i+1* 的输入，末级输出交给管线输出侧；
//! - 每次 `open()` 都从已注册列表重新装配一条全新的链路，因此关闭后重开不会出现重复挂载。
//!
//! # 逻辑解析（How）
//! - 相邻 Stage 之间以容量为 `channel_capacity` 的 `tokio::sync::mpsc` 通道连接，下游饱和时上游
//!   `emit` 等待，形成逐级背压；
//! - 每个 Stage 是一个独立任务，通过 `for_each_concurrent` 限制在途数量（默认 1，即单槽 FIFO）；
//! - 末级之后是终端转发任务，负责把 Activity 交给 [`OutputHub`]。
//!
//! # 契约说明（What）
//! - FIFO：先写入链首的 Activity 先交付给 Stage 0；
//! - Stage 自身的重排或丢弃不被链路修正；
//! - `teardown()` 只释放链首发送端，不取消在途的变换；它们恢复后的发送会因代际过期被显式丢弃。
//!
//! # 风险与考量（Trade-offs）
//! - Stage 任务在链首释放后排空队列才退出，排空期间的条目全部按过期处理，不会再调用变换函数。

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, StreamExt, stream};
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc},
};

use crate::{
    error::{StageError, TransformError},
    lifecycle::GenerationClock,
    observability::{Logger, PipelineStats},
    output::OutputHub,
    valve::{Emitter, Tagged, Transform, Valve},
};

/// 装配链路所需的共享依赖。
#[derive(Clone)]
pub(crate) struct ChainDeps {
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) log: Arc<dyn Logger>,
    pub(crate) errors: broadcast::Sender<StageError>,
    pub(crate) output: OutputHub,
    pub(crate) capacity: usize,
    pub(crate) concurrency: usize,
}

struct Wiring {
    head: mpsc::Sender<Tagged>,
    generation: u64,
    links: usize,
}

/// 有序的 Valve 序列。
#[derive(Default)]
pub struct ValveChain {
    valves: Vec<Arc<Valve>>,
    wiring: Option<Wiring>,
}

impl ValveChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在链尾追加 Stage，返回追加后的链长（从 1 开始计数）。
    pub fn register(&mut self, transform: Arc<dyn Transform>) -> usize {
        let position = self.valves.len();
        self.valves.push(Arc::new(Valve::new(position, transform)));
        self.valves.len()
    }

    pub fn len(&self) -> usize {
        self.valves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.valves.is_empty()
    }

    /// 当前已装配的链接数：相邻 Stage 之间各一条，外加末级到输出侧的一条。
    pub fn link_count(&self) -> usize {
        self.wiring.as_ref().map_or(0, |wiring| wiring.links)
    }

    pub fn labels(&self) -> Vec<String> {
        self.valves
            .iter()
            .map(|valve| valve.label().to_owned())
            .collect()
    }

    pub(crate) fn head(&self) -> Option<(mpsc::Sender<Tagged>, u64)> {
        self.wiring
            .as_ref()
            .map(|wiring| (wiring.head.clone(), wiring.generation))
    }

    pub(crate) fn wire(
        &mut self,
        runtime: &Handle,
        deps: ChainDeps,
        clock: GenerationClock,
        generation: u64,
    ) {
        debug_assert!(self.wiring.is_none(), "chain wired twice in one open period");

        let capacity = deps.capacity;
        let (head, mut upstream) = mpsc::channel::<Tagged>(capacity);
        let runner = StageRunner {
            clock: clock.clone(),
            stats: Arc::clone(&deps.stats),
            log: Arc::clone(&deps.log),
            errors: deps.errors.clone(),
            concurrency: deps.concurrency,
        };

        for valve in &self.valves {
            let (downstream, next) = mpsc::channel::<Tagged>(capacity);
            runtime.spawn(runner.clone().run(Arc::clone(valve), upstream, downstream));
            upstream = next;
        }
        runtime.spawn(run_terminal(upstream, deps.output, clock, deps.stats));

        self.wiring = Some(Wiring {
            head,
            generation,
            links: self.valves.len(),
        });
    }

    /// 拆除当前链路，返回被移除的链接数。
    pub(crate) fn teardown(&mut self) -> usize {
        self.wiring.take().map_or(0, |wiring| wiring.links)
    }
}

#[derive(Clone)]
struct StageRunner {
    clock: GenerationClock,
    stats: Arc<PipelineStats>,
    log: Arc<dyn Logger>,
    errors: broadcast::Sender<StageError>,
    concurrency: usize,
}

impl StageRunner {
    async fn run(
        self,
        valve: Arc<Valve>,
        inbound: mpsc::Receiver<Tagged>,
        downstream: mpsc::Sender<Tagged>,
    ) {
        let inbound = stream::unfold(inbound, |mut rx| async move {
            rx.recv().await.map(|tagged| (tagged, rx))
        });

        inbound
            .for_each_concurrent(self.concurrency, |tagged| {
                self.invoke(&valve, tagged, downstream.clone())
            })
            .await;

        tracing::trace!(
            target: "konduit::chain",
            position = valve.position(),
            "valve drained"
        );
    }

    async fn invoke(&self, valve: &Valve, tagged: Tagged, downstream: mpsc::Sender<Tagged>) {
        if self.clock.current() != tagged.generation {
            self.stats.record_stale();
            return;
        }

        let emitter = Emitter::new(
            valve.position(),
            tagged.generation,
            self.clock.clone(),
            downstream,
            Arc::clone(&self.stats),
        );
        let outcome = AssertUnwindSafe(valve.transformer().transform(tagged.activity, emitter))
            .catch_unwind()
            .await;

        let cause = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(cause)) => cause,
            Err(panic) => TransformError::panicked(panic_message(panic.as_ref())),
        };

        let error = StageError::new(valve.position(), valve.label_owned(), cause);
        self.stats.record_stage_failure();
        self.log.error(&error.to_string());
        // 无订阅者时发送失败，属于预期情况。
        let _ = self.errors.send(error);
    }
}

async fn run_terminal(
    mut inbound: mpsc::Receiver<Tagged>,
    output: OutputHub,
    clock: GenerationClock,
    stats: Arc<PipelineStats>,
) {
    while let Some(tagged) = inbound.recv().await {
        if clock.current() != tagged.generation {
            stats.record_stale();
            continue;
        }
        output
            .broadcast(tagged.activity, tagged.generation, &clock)
            .await;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "transform panicked".to_owned()
    }
}
