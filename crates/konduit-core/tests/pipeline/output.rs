use std::sync::Arc;

use futures::StreamExt;
use konduit_core::{Activity, Pipeline, PipelineOptions, map_fn, test_stubs::NoopLogger};
use tokio::sync::mpsc;

use super::support::{WAIT, assert_silent, eventually, increment_deferred, next, recording_pipeline};

/// 监听者计数覆盖链路内部链接与输出订阅，关闭后归零。
#[tokio::test]
async fn listener_count_drops_to_zero_after_close() {
    let (pipeline, _) = recording_pipeline();
    for _ in 0..3 {
        pipeline.use_valve(increment_deferred()).expect("追加");
    }
    assert_eq!(pipeline.listener_count(), 0, "未打开时没有任何链接");

    pipeline.open().expect("打开");
    assert_eq!(pipeline.listener_count(), 3);

    let mut first = pipeline.subscribe();
    let (tx, _rx) = mpsc::channel::<Activity>(4);
    pipeline.pipe(tx).expect("转接");
    assert_eq!(pipeline.listener_count(), 5);

    pipeline.close().expect("关闭");
    assert_eq!(pipeline.listener_count(), 0);
    assert!(first.recv().await.is_none(), "关闭后订阅随之结束");
}

/// 订阅实现 Stream，多个订阅者各自收到同一份输出。
#[tokio::test]
async fn every_subscriber_observes_each_output() {
    let (pipeline, _) = recording_pipeline();
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.open().expect("打开");

    let mut first = pipeline.subscribe();
    let mut second = pipeline.subscribe();
    for touched in 0..3 {
        pipeline
            .write(Activity::from_iter([("touched", touched)]))
            .await
            .expect("写入");
    }

    for expected in 1..=3 {
        let item = tokio::time::timeout(WAIT, first.next())
            .await
            .expect("及时输出")
            .expect("订阅有效");
        assert_eq!(item.get_i64("touched"), Some(expected));
        assert_eq!(next(&mut second).await.get_i64("touched"), Some(expected));
    }
    eventually(|| pipeline.stats().emitted == 3).await;
}

/// 无订阅者时输出被丢弃并计数。
#[tokio::test]
async fn outputs_without_subscribers_are_counted_as_unobserved() {
    let (pipeline, _) = recording_pipeline();
    pipeline.use_valve(map_fn(|activity| activity)).expect("追加");
    pipeline.open().expect("打开");

    pipeline.write(Activity::new()).await.expect("写入");
    eventually(|| pipeline.stats().unobserved == 1).await;
    assert_eq!(pipeline.stats().emitted, 0);
}

/// `pipe` 把输出转交给外部通道，`unpipe` 后不再转交。
#[tokio::test]
async fn pipe_forwards_until_unpiped() {
    let (pipeline, _) = recording_pipeline();
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.open().expect("打开");

    let (tx, mut rx) = mpsc::channel::<Activity>(4);
    let handle = pipeline.pipe(tx).expect("转接");

    pipeline.write(Activity::new()).await.expect("写入");
    let forwarded = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("及时转交")
        .expect("通道有效");
    assert_eq!(forwarded.get_i64("touched"), Some(1));

    assert!(pipeline.unpipe(handle), "首次解除成功");
    assert!(!pipeline.unpipe(handle), "句柄已失效");

    let mut probe = pipeline.subscribe();
    pipeline.write(Activity::new()).await.expect("写入");
    next(&mut probe).await;
    let closed = tokio::time::timeout(WAIT, rx.recv()).await.expect("转接任务结束");
    assert!(closed.is_none(), "解除后转接任务释放发送端");
}

/// 管线可以首尾相接：上游的输出作为下游的本地写入。
#[tokio::test]
async fn pipelines_can_be_chained_through_pipe() {
    let (upstream, upstream_bus) = recording_pipeline();
    upstream.use_valve(increment_deferred()).expect("追加");
    upstream.open().expect("打开");

    let downstream = Pipeline::new(PipelineOptions::new().with_logger(Arc::new(NoopLogger)))
        .expect("合法选项");
    downstream.use_valve(increment_deferred()).expect("追加");
    downstream.open().expect("打开");
    let mut output = downstream.subscribe();

    upstream.pipe(downstream.clone()).expect("转接");
    upstream
        .write(Activity::from_iter([("touched", 10)]))
        .await
        .expect("写入");

    assert_eq!(next(&mut output).await.get_i64("touched"), Some(12));
    assert_eq!(upstream_bus.publish_count(), 1);
    assert_eq!(downstream.stats().local_writes, 1);
    assert_silent(&mut output).await;
}
