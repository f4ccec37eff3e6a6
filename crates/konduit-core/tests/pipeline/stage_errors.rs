use std::sync::Arc;

use konduit_core::{
    Activity, Emitter, Pipeline, PipelineOptions, StageErrorKind, TransformError,
    test_stubs::{LogLevel, RecordingLogger},
    valve_fn,
};

use super::support::{WAIT, eventually, increment_deferred, next};

fn guarded() -> impl konduit_core::Transform {
    valve_fn(|activity: Activity, emitter: Emitter| async move {
        if activity.contains("reject") {
            return Err(TransformError::rejected("activity flagged for rejection"));
        }
        if activity.contains("fail") {
            return Err(TransformError::failed("downstream store unavailable"));
        }
        if activity.contains("explode") {
            panic!("boom");
        }
        emitter.emit(activity).await;
        Ok(())
    })
    .named("guard")
}

fn pipeline_with(logger: Arc<RecordingLogger>) -> Pipeline {
    let pipeline =
        Pipeline::new(PipelineOptions::new().with_logger(logger)).expect("合法选项");
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.use_valve(guarded()).expect("追加");
    pipeline.open().expect("打开");
    pipeline
}

/// Stage 返回错误时广播带定位信息的 StageError，后续输入照常处理。
#[tokio::test]
async fn rejected_activity_is_reported_and_chain_keeps_running() {
    let logger = Arc::new(RecordingLogger::new());
    let pipeline = pipeline_with(logger.clone());
    let mut errors = pipeline.stage_errors();
    let mut output = pipeline.subscribe();

    pipeline
        .write(Activity::from_iter([("reject", true)]))
        .await
        .expect("写入");
    let error = tokio::time::timeout(WAIT, errors.recv())
        .await
        .expect("及时上报")
        .expect("广播有效");
    assert_eq!(error.position(), 1);
    assert_eq!(error.label(), "guard");
    assert_eq!(error.kind(), StageErrorKind::Rejected);
    assert_eq!(error.cause().message(), "activity flagged for rejection");

    pipeline.write(Activity::new()).await.expect("写入");
    assert_eq!(next(&mut output).await.get_i64("touched"), Some(1));

    assert_eq!(pipeline.stats().stage_failures, 1);
    eventually(|| logger.contains(LogLevel::Error, "valve #1 (`guard`) rejected")).await;
}

/// Stage 内的 panic 被捕获并转换为 Panicked，不会拖垮链路。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_transform_is_isolated() {
    let logger = Arc::new(RecordingLogger::new());
    let pipeline = pipeline_with(logger.clone());
    let mut errors = pipeline.stage_errors();
    let mut output = pipeline.subscribe();

    pipeline
        .write(Activity::from_iter([("explode", true)]))
        .await
        .expect("写入");
    let error = tokio::time::timeout(WAIT, errors.recv())
        .await
        .expect("及时上报")
        .expect("广播有效");
    assert_eq!(error.kind(), StageErrorKind::Panicked);
    assert!(error.to_string().contains("boom"), "{error}");

    pipeline.write(Activity::new()).await.expect("写入");
    assert_eq!(next(&mut output).await.get_i64("touched"), Some(1));
}

/// `TransformError::failed` 以 Failed 分类上报，与拒绝区分开。
#[tokio::test]
async fn failed_transform_is_reported_with_failed_kind() {
    let logger = Arc::new(RecordingLogger::new());
    let pipeline = pipeline_with(logger.clone());
    let mut errors = pipeline.stage_errors();

    pipeline
        .write(Activity::from_iter([("fail", true)]))
        .await
        .expect("写入");
    let error = tokio::time::timeout(WAIT, errors.recv())
        .await
        .expect("及时上报")
        .expect("广播有效");
    assert_eq!(error.kind(), StageErrorKind::Failed);
    assert_eq!(error.cause().message(), "downstream store unavailable");
    assert_eq!(
        error.to_string(),
        "valve #1 (`guard`) failed: downstream store unavailable"
    );
    assert!(logger.contains(LogLevel::Error, "failed: downstream store unavailable"));
}
