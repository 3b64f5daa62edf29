use domain::TargetData;
use edge_config::{ConfigSubset, EndpointConfig};
use edge_ipc::wire::{Frame, split_stream};
use edge_ipc::{
    EnqueuePolicy, IpcError, SessionConfig, SessionState, TargetWriter, TargetWriterOptions,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);
const SWALLOW: Duration = Duration::from_millis(200);

/// 记录初始化与收到的批次并回传 `received`。第一条写入流只确认第一个批次，
/// 之后读到的批次不记录也不确认，随后断开。
async fn serve(listener: TcpListener, events: mpsc::UnboundedSender<String>) {
    let dropped = Arc::new(AtomicBool::new(false));
    loop {
        let Ok((tcp, _)) = listener.accept().await else {
            return;
        };
        let events = events.clone();
        let dropped = Arc::clone(&dropped);
        tokio::spawn(async move {
            let (mut reader, mut writer) = split_stream(tcp);
            match reader.next().await {
                Ok(Some(Frame::Initialize { .. })) => {
                    let _ = events.send("init".to_string());
                    let _ = writer
                        .send(&Frame::InitializeReply {
                            initialized: true,
                            message: String::new(),
                        })
                        .await;
                }
                Ok(Some(Frame::WriteValues { data })) => {
                    let _ = events.send(data.serial.clone());
                    let _ = writer.send(&Frame::Received { serial: data.serial }).await;
                    if !dropped.swap(true, Ordering::SeqCst) {
                        // 连接已死但客户端仍在写入
                        while let Ok(Ok(Some(_))) = tokio::time::timeout(SWALLOW, reader.next()).await {}
                        return;
                    }
                    while let Ok(Some(Frame::WriteValues { data })) = reader.next().await {
                        let _ = events.send(data.serial.clone());
                        let _ = writer.send(&Frame::Received { serial: data.serial }).await;
                    }
                }
                _ => {}
            }
        });
    }
}

/// 等待所有批次被确认。
async fn drained(writer: &TargetWriter) {
    tokio::time::timeout(WAIT, async {
        while writer.pending().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all batches confirmed");
}

fn handoff() -> ConfigSubset {
    ConfigSubset::build(
        &json!({"Targets": {"debug": {"TargetType": "DEBUG-TARGET"}}}),
        &BTreeMap::new(),
    )
    .expect("handoff")
}

fn batch(serial: &str) -> TargetData {
    TargetData::new("schedule", serial, json!({"value": serial}))
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event")
}

#[tokio::test]
async fn batches_survive_reconnect_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = tokio::spawn(serve(listener, events_tx));

    let writer = TargetWriter::start(
        EndpointConfig::new("127.0.0.1", port),
        "debug",
        handoff(),
        None,
        TargetWriterOptions {
            session: SessionConfig {
                reconnect_delay: Duration::from_secs(1),
                readiness_poll: Duration::from_millis(20),
            },
            ..TargetWriterOptions::default()
        },
    );

    writer.write_target_data(batch("1")).await.expect("enqueue 1");
    assert_eq!(next_event(&mut events).await, "init");
    assert_eq!(next_event(&mut events).await, "1");

    // 服务端断开写入流后会话进入退避
    tokio::time::timeout(WAIT, writer.session().wait_for(SessionState::Backoff))
        .await
        .expect("backoff in time")
        .expect("backoff");
    assert!(!writer.is_initialized());

    writer.write_target_data(batch("2")).await.expect("enqueue 2");
    writer.write_target_data(batch("3")).await.expect("enqueue 3");

    assert_eq!(next_event(&mut events).await, "init");
    assert_eq!(next_event(&mut events).await, "2");
    assert_eq!(next_event(&mut events).await, "3");
    assert!(writer.is_initialized());
    drained(&writer).await;

    writer.stop().await.expect("stop");
    server.abort();
    assert!(events.try_recv().is_err(), "no batch delivered twice");
}

#[tokio::test]
async fn unconfirmed_batches_resent_once_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = tokio::spawn(serve(listener, events_tx));

    let writer = TargetWriter::start(
        EndpointConfig::new("127.0.0.1", port),
        "debug",
        handoff(),
        None,
        TargetWriterOptions {
            session: SessionConfig {
                reconnect_delay: Duration::from_millis(100),
                readiness_poll: Duration::from_millis(20),
            },
            ..TargetWriterOptions::default()
        },
    );

    // 三个批次在连接建立前入队，第二、三个写进已死的流
    for serial in ["1", "2", "3"] {
        writer.write_target_data(batch(serial)).await.expect("enqueue");
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(next_event(&mut events).await);
    }
    assert_eq!(received, ["init", "1", "init", "2", "3"]);
    drained(&writer).await;

    writer.stop().await.expect("stop");
    server.abort();
    assert!(events.try_recv().is_err(), "no batch delivered twice");
}

#[tokio::test]
async fn full_queue_fails_after_budget() {
    // 端口上没有服务，队列不会被消费
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("free port");

    let writer = TargetWriter::start(
        EndpointConfig::new("127.0.0.1", port),
        "debug",
        handoff(),
        None,
        TargetWriterOptions {
            capacity: 1,
            enqueue: EnqueuePolicy {
                initial_wait: Duration::from_millis(10),
                max_wait: Duration::from_millis(40),
                budget: Duration::from_millis(200),
            },
            session: SessionConfig {
                reconnect_delay: Duration::from_secs(30),
                readiness_poll: Duration::from_millis(20),
            },
        },
    );

    writer.write_target_data(batch("1")).await.expect("first fits");
    let err = writer
        .write_target_data(batch("2"))
        .await
        .expect_err("queue is full");
    assert!(matches!(err, IpcError::Backpressure { waited_ms } if waited_ms >= 200));
    assert_eq!(writer.pending().await, 1);

    writer.stop().await.expect("stop");
}
