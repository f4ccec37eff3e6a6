use std::sync::Arc;

use async_trait::async_trait;
use konduit_core::{
    Activity, DEFAULT_NAMESPACE, MemoryRelayBus, Pipeline, PipelineOptions, RelayBus, RelayError,
    RelayHandler, SUPPRESSION_MARKER, map_fn,
    test_stubs::{NoopLogger, RecordingRelayBus},
};
use proptest::prelude::*;
use serde_json::json;
use tokio::sync::Notify;

use super::support::{assert_silent, eventually, increment_deferred, next, recording_pipeline};

/// `publish` 进入后挂起，直到测试放行。
#[derive(Default)]
struct GatedRelayBus {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl RelayBus for GatedRelayBus {
    async fn publish(&self, _namespace: &str, _activity: &Activity) -> Result<(), RelayError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    fn subscribe(&self, _namespace: &str, _handler: RelayHandler) -> Result<(), RelayError> {
        Ok(())
    }
}

/// 本地写入发布一次；总线投递进入链路但不再发布。
#[tokio::test]
async fn local_writes_publish_once_and_relayed_writes_never() {
    let (pipeline, bus) = recording_pipeline();
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.open().expect("打开");
    let mut output = pipeline.subscribe();

    pipeline
        .write(Activity::from_iter([("id", "local")]))
        .await
        .expect("本地写入");
    assert_eq!(next(&mut output).await.get("id"), Some(&json!("local")));

    bus.deliver(Activity::from_iter([("id", "remote")])).await;
    assert_eq!(next(&mut output).await.get("id"), Some(&json!("remote")));

    let published = bus.published();
    assert_eq!(published.len(), 1, "中继写入不得再次发布");
    assert_eq!(published[0].0, pipeline.namespace());
    assert_eq!(published[0].1.get("id"), Some(&json!("local")));

    let stats = pipeline.stats();
    assert_eq!(stats.local_writes, 1);
    assert_eq!(stats.relay_writes, 1);
    assert_eq!(stats.published, 1);
}

/// 构造期即完成订阅，与是否打开无关。
#[test]
fn subscription_happens_at_construction() {
    let bus = Arc::new(RecordingRelayBus::new());
    let pipeline = Pipeline::new(
        PipelineOptions::new()
            .with_relay_bus(bus.clone())
            .with_namespace("com.example.ns")
            .with_logger(Arc::new(NoopLogger)),
    )
    .expect("合法选项");

    assert!(!pipeline.is_open());
    assert_eq!(bus.subscribed_namespaces(), ["com.example.ns"]);
}

/// Closed 期间的总线投递被静默丢弃。
#[tokio::test]
async fn inbound_while_closed_is_dropped() {
    let (pipeline, bus) = recording_pipeline();
    pipeline.use_valve(increment_deferred()).expect("追加");

    bus.deliver(Activity::from_iter([("id", "early")])).await;
    assert_eq!(pipeline.stats().relay_dropped, 1);
    assert_eq!(pipeline.stats().relay_writes, 0);

    pipeline.open().expect("打开");
    let mut output = pipeline.subscribe();
    assert_silent(&mut output).await;
    assert_eq!(bus.publish_count(), 0);
}

/// 旧版标记同样抑制发布，并且不会泄漏到链路中。
#[tokio::test]
async fn legacy_marker_is_stripped_and_suppresses_publish() {
    let (pipeline, bus) = recording_pipeline();
    pipeline.use_valve(map_fn(|activity| activity)).expect("追加");
    pipeline.open().expect("打开");
    let mut output = pipeline.subscribe();

    pipeline
        .write(Activity::from_iter([
            ("id", json!("legacy")),
            (SUPPRESSION_MARKER, json!(true)),
        ]))
        .await
        .expect("写入");

    let activity = next(&mut output).await;
    assert!(!activity.contains(SUPPRESSION_MARKER), "标记必须被剥离");
    assert_eq!(activity.get("id"), Some(&json!("legacy")));
    assert_eq!(bus.publish_count(), 0);
    assert_eq!(pipeline.stats().relay_writes, 1);
}

/// 发布失败仅记录，本地投递照常进行。
#[tokio::test]
async fn publish_failure_does_not_block_local_delivery() {
    let bus = Arc::new(RecordingRelayBus::failing());
    let pipeline = Pipeline::new(
        PipelineOptions::new()
            .with_relay_bus(bus.clone())
            .with_logger(Arc::new(NoopLogger)),
    )
    .expect("合法选项");
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.open().expect("打开");
    let mut output = pipeline.subscribe();

    pipeline.write(Activity::new()).await.expect("发布失败不影响写入");

    assert_eq!(next(&mut output).await.get_i64("touched"), Some(1));
    let stats = pipeline.stats();
    assert_eq!(stats.publish_failures, 1);
    assert_eq!(stats.published, 0);
    assert_eq!(bus.publish_count(), 1, "发布仍然被尝试且只尝试一次");
}

/// 两条管线共享同一总线时，镜像只发生一次，不会回声。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_bus_mirrors_without_echo() {
    let bus = MemoryRelayBus::new();
    let build = || {
        let pipeline = Pipeline::new(
            PipelineOptions::new()
                .with_relay_bus(Arc::new(bus.endpoint()))
                .with_logger(Arc::new(NoopLogger)),
        )
        .expect("合法选项");
        pipeline.use_valve(increment_deferred()).expect("追加");
        pipeline.open().expect("打开");
        pipeline
    };
    let left = build();
    let right = build();
    assert_eq!(bus.subscriber_count(left.namespace()), 2);

    let mut left_output = left.subscribe();
    let mut right_output = right.subscribe();

    left.write(Activity::from_iter([("id", "L1")]))
        .await
        .expect("写入");

    assert_eq!(next(&mut left_output).await.get("id"), Some(&json!("L1")));
    assert_eq!(next(&mut right_output).await.get("id"), Some(&json!("L1")));

    eventually(|| right.stats().relay_writes == 1).await;
    assert_silent(&mut left_output).await;
    assert_silent(&mut right_output).await;

    assert_eq!(left.stats().published, 1);
    assert_eq!(left.stats().relay_writes, 0, "发布方不应收到自己的回声");
    assert_eq!(right.stats().published, 0, "镜像方不得再次发布");
}

/// 管线释放后，其总线订阅在下一次投递时被注销。
#[tokio::test]
async fn dropped_pipeline_releases_its_bus_subscription() {
    let bus = MemoryRelayBus::new();
    let pipeline = Pipeline::new(
        PipelineOptions::new()
            .with_relay_bus(Arc::new(bus.endpoint()))
            .with_logger(Arc::new(NoopLogger)),
    )
    .expect("合法选项");
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.open().expect("打开");
    assert_eq!(bus.subscriber_count(DEFAULT_NAMESPACE), 1);

    drop(pipeline);
    let publisher = bus.endpoint();
    for index in 0..3 {
        publisher
            .publish(DEFAULT_NAMESPACE, &Activity::from_iter([("index", index)]))
            .await
            .expect("进程内总线发布不会失败");
    }

    eventually(|| bus.subscriber_count(DEFAULT_NAMESPACE) == 0).await;
}

/// 记录型总线同样能观察到订阅方已释放。
#[tokio::test]
async fn handler_reports_released_pipeline() {
    let (pipeline, bus) = recording_pipeline();
    assert_eq!(bus.deliver(Activity::new()).await, 1, "存活的管线报告自身仍在订阅");

    drop(pipeline);
    assert_eq!(bus.deliver(Activity::new()).await, 0);
}

/// 发布挂起期间关闭并重开，该写入携带旧代际被丢弃，不会泄漏进新链路。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_during_in_flight_publish_drops_the_write_as_stale() {
    let bus = Arc::new(GatedRelayBus::default());
    let pipeline = Pipeline::new(
        PipelineOptions::new()
            .with_relay_bus(bus.clone())
            .with_logger(Arc::new(NoopLogger)),
    )
    .expect("合法选项");
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.open().expect("打开");

    let writer = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.write(Activity::new()).await })
    };
    bus.entered.notified().await;

    pipeline.close().expect("关闭");
    pipeline.open().expect("重开");
    let mut output = pipeline.subscribe();
    bus.release.notify_one();

    writer
        .await
        .expect("写入任务完成")
        .expect("写入在关闭前已被受理");
    eventually(|| pipeline.stats().stale_dropped == 1).await;
    assert_silent(&mut output).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// 任意交错的本地写入与中继投递下，发布次数恒等于本地写入次数。
    #[test]
    fn publish_count_equals_local_write_count(sources in proptest::collection::vec(any::<bool>(), 0..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("构建运行时");

        runtime.block_on(async {
            let (pipeline, bus) = recording_pipeline();
            pipeline.use_valve(map_fn(|activity| activity)).expect("追加");
            pipeline.open().expect("打开");
            let mut output = pipeline.subscribe();

            for (index, local) in sources.iter().enumerate() {
                let activity = Activity::from_iter([("index", index)]);
                if *local {
                    pipeline.write(activity).await.expect("写入");
                } else {
                    bus.deliver(activity).await;
                }
                next(&mut output).await;
            }

            let locals = sources.iter().filter(|local| **local).count();
            prop_assert_eq!(bus.publish_count(), locals);
            prop_assert_eq!(pipeline.stats().relay_writes as usize, sources.len() - locals);
            Ok(())
        })?;
    }
}
