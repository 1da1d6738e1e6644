//! The encode/publish branch against a local TCP endpoint.

use std::io::Read;
use std::net::TcpListener;
use std::thread::JoinHandle;
use std::time::Duration;

use livemix_common::error::LivemixError;
use livemix_pipeline_core::{
    ControllerConfig, FormatContract, Fraction, Graph, GraphState, LifecycleController, OptionValue,
    PixelFormat, ProviderRegistry, StageKind, StopReason,
};

fn provider() -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_core();
    livemix_render_engine::register(&mut registry);
    livemix_publish_engine::register(&mut registry);
    registry
}

fn branch(location: &str, frames: i64, live: bool) -> Graph {
    let mut graph = Graph::new("publish-branch", provider().into_shared());
    let capture = graph
        .add_stage(
            StageKind::Capture,
            "capture",
            [
                ("pattern", OptionValue::from("ball")),
                ("num-buffers", OptionValue::Int(frames)),
                ("is-live", OptionValue::Bool(live)),
            ],
        )
        .unwrap();
    let encoder = graph
        .add_stage(
            StageKind::Encoder,
            "encoder",
            [
                ("bitrate", OptionValue::Int(3000)),
                ("key-int-max", OptionValue::Int(15)),
                ("speed-preset", OptionValue::Int(1)),
                ("tune", OptionValue::Int(4)),
            ],
        )
        .unwrap();
    let muxer = graph.add_stage(StageKind::Muxer, "muxer", []).unwrap();
    let sink = graph
        .add_stage(StageKind::NetworkSink, "network_sink", [("location", OptionValue::from(location))])
        .unwrap();
    let contract = FormatContract::raw(PixelFormat::I420, 64, 36, Fraction::new(30, 1));
    graph.link_stages_with_contract(capture, encoder, contract).unwrap();
    graph.link_many(&[encoder, muxer, sink]).unwrap();
    graph
}

/// Accept one connection and collect everything sent on it.
fn collect(listener: TcpListener) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut data = Vec::new();
        peer.read_to_end(&mut data).unwrap();
        data
    })
}

/// `(tag type, first body byte)` of every tag in an FLV stream.
fn tags(stream: &[u8]) -> Vec<(u8, u8)> {
    let mut out = Vec::new();
    let mut pos = 13;
    while pos + 11 <= stream.len() {
        let size = (usize::from(stream[pos + 1]) << 16)
            | (usize::from(stream[pos + 2]) << 8)
            | usize::from(stream[pos + 3]);
        out.push((stream[pos], stream[pos + 11]));
        pos += 11 + size + 4;
    }
    out
}

#[tokio::test]
async fn test_branch_streams_flv() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = collect(listener);

    let graph = branch(&format!("tcp://127.0.0.1:{port}"), 20, false);
    let mut controller = LifecycleController::new(graph, ControllerConfig::default());
    controller.play().await.unwrap();
    let outcome = controller
        .run(tokio::time::sleep(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(outcome.reason, StopReason::EndOfStream);

    let stream = received.join().unwrap();
    assert_eq!(&stream[..3], b"FLV");
    let tags = tags(&stream);
    // Metadata, sequence header, then one tag per frame.
    assert_eq!(tags.len(), 22);
    assert_eq!(tags[0].0, 18);
    assert!(tags[1..].iter().all(|(kind, _)| *kind == 9));
    let keyframes = tags[2..].iter().filter(|(_, flags)| flags >> 4 == 1).count();
    assert_eq!(keyframes, 2);
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_transition() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let graph = branch(&format!("tcp://127.0.0.1:{port}"), -1, true);
    let mut controller = LifecycleController::new(graph, ControllerConfig::default());
    let err = controller.play().await.unwrap_err();
    match &err {
        LivemixError::ResourceUnavailable { stage, .. } => assert_eq!(stage, "network_sink"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 3);
    assert_eq!(controller.state(), GraphState::Ready);
    controller.stop();
    assert_eq!(controller.state(), GraphState::Stopped);
}

#[tokio::test]
async fn test_dropped_connection_is_a_fault() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let hangup = std::thread::spawn(move || {
        let (peer, _) = listener.accept().unwrap();
        drop(peer);
    });

    let graph = branch(&format!("tcp://127.0.0.1:{port}"), -1, true);
    let mut controller = LifecycleController::new(graph, ControllerConfig::default());
    controller.play().await.unwrap();
    hangup.join().unwrap();
    let outcome = controller
        .run(tokio::time::sleep(Duration::from_secs(20)))
        .await
        .unwrap();

    match outcome.reason {
        StopReason::Fault(fault) => {
            assert_eq!(fault.stage, "network_sink");
            assert!(fault.message.contains("Could not write"), "{}", fault.message);
        }
        other => panic!("expected a fault, got {other:?}"),
    }
    assert_eq!(controller.state(), GraphState::Stopped);
}
