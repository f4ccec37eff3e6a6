use std::sync::Arc;

use konduit_core::{Activity, Pipeline, PipelineOptions, test_stubs::RecordingRelayBus};
use tracing_test::traced_test;

use super::support::{increment_deferred, next};

/// 默认 Logger 经由 `tracing` 输出生命周期与发布失败日志。
#[tokio::test]
#[traced_test]
async fn default_logger_reports_through_tracing() {
    let pipeline = Pipeline::new(
        PipelineOptions::new()
            .with_relay_bus(Arc::new(RecordingRelayBus::failing()))
            .with_namespace("com.example.logs"),
    )
    .expect("合法选项");
    pipeline.use_valve(increment_deferred()).expect("追加");
    pipeline.use_valve(increment_deferred()).expect("追加");

    pipeline.open().expect("打开");
    assert!(logs_contain(
        "pipeline opened with 2 valve(s) on `com.example.logs`"
    ));

    let mut output = pipeline.subscribe();
    pipeline.write(Activity::new()).await.expect("写入");
    next(&mut output).await;
    assert!(logs_contain("relay publish failed"));

    pipeline.close().expect("关闭");
    assert!(logs_contain("detached 2 link(s) and 1 listener(s)"));
}
