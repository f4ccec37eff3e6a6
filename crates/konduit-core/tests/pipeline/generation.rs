use konduit_core::{Activity, EmitOutcome, Emitter, TransformError, valve_fn};
use tokio::sync::mpsc;

use super::support::{WAIT, assert_silent, next, recording_pipeline};

/// 把每个输入连同其延续交给测试侧，由测试决定何时发出。
fn parked(tx: mpsc::UnboundedSender<(Activity, Emitter)>) -> impl konduit_core::Transform {
    valve_fn(move |activity: Activity, emitter: Emitter| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((activity, emitter));
            Ok::<(), TransformError>(())
        }
    })
}

async fn take(rx: &mut mpsc::UnboundedReceiver<(Activity, Emitter)>) -> (Activity, Emitter) {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Stage 及时被调用")
        .expect("通道有效")
}

/// 返回后再发出的延续在当前代际内照常转发。
#[tokio::test]
async fn deferred_emit_within_generation_is_forwarded() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (pipeline, _) = recording_pipeline();
    pipeline.use_valve(parked(tx)).expect("追加");
    pipeline.open().expect("打开");
    let mut output = pipeline.subscribe();

    pipeline
        .write(Activity::from_iter([("id", 1)]))
        .await
        .expect("写入");
    let (activity, emitter) = take(&mut rx).await;
    assert!(emitter.is_current());
    assert_eq!(emitter.position(), 0);

    assert_eq!(emitter.emit(activity).await, EmitOutcome::Forwarded);
    assert_eq!(next(&mut output).await.get_i64("id"), Some(1));
}

/// 关闭之后恢复的延续被显式判定为过期，重开也不会让它复活。
#[tokio::test]
async fn emit_after_close_is_discarded_as_stale() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (pipeline, _) = recording_pipeline();
    pipeline.use_valve(parked(tx)).expect("追加");
    pipeline.open().expect("打开");

    pipeline
        .write(Activity::from_iter([("id", 1)]))
        .await
        .expect("写入");
    let (activity, emitter) = take(&mut rx).await;

    pipeline.close().expect("关闭");
    assert!(!emitter.is_current());
    assert_eq!(emitter.emit(activity.clone()).await, EmitOutcome::Stale);
    assert_eq!(pipeline.stats().stale_dropped, 1);

    pipeline.open().expect("重开");
    let mut output = pipeline.subscribe();
    assert_eq!(emitter.emit(activity).await, EmitOutcome::Stale);
    assert_silent(&mut output).await;

    pipeline
        .write(Activity::from_iter([("id", 2)]))
        .await
        .expect("重开后写入");
    let (fresh, fresh_emitter) = take(&mut rx).await;
    assert_eq!(fresh_emitter.emit(fresh).await, EmitOutcome::Forwarded);
    assert_eq!(next(&mut output).await.get_i64("id"), Some(2));
    assert_eq!(pipeline.stats().stale_dropped, 2);
}
