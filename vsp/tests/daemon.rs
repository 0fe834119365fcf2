//! End-to-end tests: full daemon over a real unix socket, with fake
//! platform and link layers and the in-memory dataplane backend.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper_util::rt::TokioIo;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tonic::Code;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use vsp::config::{DataplaneKind, VspConfig};
use vsp::daemon::{LifecycleState, VspDaemon};
use vsp::dataplane::DebugDriver;
use vsp::proto::bridge_port_service_client::BridgePortServiceClient;
use vsp::proto::device_service_client::DeviceServiceClient;
use vsp::proto::life_cycle_service_client::LifeCycleServiceClient;
use vsp::proto::network_function_service_client::NetworkFunctionServiceClient;
use vsp::proto::{
    BridgePort, CreateBridgePortRequest, DeleteBridgePortRequest, Empty, InitRequest, NfRequest,
    VfCount,
};
use vsp::test_util::{FakeNetOps, FakePlatform};

struct TestDaemon {
    daemon: Arc<VspDaemon>,
    ops: Arc<FakeNetOps>,
    driver: Arc<DebugDriver>,
    socket: PathBuf,
    // keeps the socket directory alive for the duration of the test
    _dir: TempDir,
}

fn test_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("vsp.sock");

    let config = VspConfig {
        dataplane: DataplaneKind::Debug,
        ..VspConfig::default()
    };
    let ops = Arc::new(FakeNetOps::new());
    let platform = Arc::new(FakePlatform::new());
    let driver = Arc::new(DebugDriver::new());

    platform.add_device("177d", "a0f7", "0000:01:00.0");
    platform.add_device("177d", "b900", "0000:03:00.0");
    platform.add_netdev("0000:01:00.0", "enP2p3s0");
    platform.add_netdev("0000:03:00.0", "enP3p1s0");
    platform.add_virtfn("0000:01:00.0", 0, "0000:01:02.0");
    platform.add_virtfn("0000:01:00.0", 1, "0000:01:02.1");
    platform.add_netdev("0000:01:02.0", "eth_vf0");
    platform.add_netdev("0000:01:02.1", "eth_vf1");
    ops.add_link("enP2p3s0");
    ops.add_link("enP3p1s0");
    ops.set_interface_addrs("enP2p3s0", vec!["fe80::1".parse::<IpAddr>().unwrap()]);
    ops.set_neighbors(vec!["fe80::1".parse().unwrap()]);

    let daemon = VspDaemon::with_parts(config, socket.clone(), platform, ops.clone(), driver.clone());
    TestDaemon {
        daemon,
        ops,
        driver,
        socket,
        _dir: dir,
    }
}

async fn connect(socket: PathBuf) -> Channel {
    // dummy authority; the connector dials the unix socket
    Endpoint::try_from("http://vsp")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move {
                let stream = UnixStream::connect(socket).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .unwrap()
}

#[tokio::test]
async fn full_dpu_session_over_socket() {
    let t = test_daemon();
    let listener = t.daemon.listen().await.unwrap();
    let serving = tokio::spawn(t.daemon.clone().serve(listener));

    let channel = connect(t.socket.clone()).await;
    let mut lifecycle = LifeCycleServiceClient::new(channel.clone());
    let mut devices = DeviceServiceClient::new(channel.clone());
    let mut bridge_ports = BridgePortServiceClient::new(channel.clone());
    let mut network_fns = NetworkFunctionServiceClient::new(channel);

    // Init in DPU mode returns the fixed link-local endpoint
    let ip_port = lifecycle
        .init(InitRequest { dpu_mode: true })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(ip_port.ip, "[fe80::1%enP2p3s0]");
    assert_eq!(ip_port.port, 8085);

    // two healthy provisioned pairs
    let listing = devices.get_devices(Empty {}).await.unwrap().into_inner();
    assert_eq!(listing.devices.len(), 2);
    for (id, device) in &listing.devices {
        assert_eq!(&device.id, id);
        assert_eq!(device.health, "Healthy");
    }

    // attach and detach a VF
    let created = bridge_ports
        .create_bridge_port(CreateBridgePortRequest {
            bridge_port: Some(BridgePort {
                name: "host0-1".to_string(),
                spec: None,
                status: None,
            }),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(created.name, "bridge_port/host0-1");
    assert_eq!(t.driver.ports("br-mrv0").unwrap(), vec!["eth_vf1"]);

    bridge_ports
        .delete_bridge_port(DeleteBridgePortRequest {
            name: "host0-1".to_string(),
            allow_missing: false,
        })
        .await
        .unwrap();
    assert!(t.driver.ports("br-mrv0").unwrap().is_empty());

    // network-function lifecycle is accepted
    network_fns
        .create_network_function(NfRequest {
            input: "nf_interface0".to_string(),
            output: "dp_interface0".to_string(),
        })
        .await
        .unwrap();

    // VF count control is a host-side operation
    let err = devices.set_num_vfs(VfCount { vf_cnt: 4 }).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    // external stop tears everything down and the server drains
    t.daemon.stop().await.unwrap();
    serving.await.unwrap().unwrap();
    assert_eq!(t.daemon.state(), LifecycleState::Stopped);
    assert!(t.driver.ports("br-mrv0").is_none());
    assert!(!t.ops.link_names().contains(&"nf_interface0".to_string()));
}

#[tokio::test]
async fn rpc_errors_map_to_status_codes() {
    let t = test_daemon();
    let listener = t.daemon.listen().await.unwrap();
    let serving = tokio::spawn(t.daemon.clone().serve(listener));

    let channel = connect(t.socket.clone()).await;
    let mut devices = DeviceServiceClient::new(channel.clone());
    let mut bridge_ports = BridgePortServiceClient::new(channel);

    // device store not initialized until Init runs in DPU mode
    let err = devices.get_devices(Empty {}).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    // unparseable bridge-port name
    let err = bridge_ports
        .create_bridge_port(CreateBridgePortRequest {
            bridge_port: Some(BridgePort {
                name: "not-a-port".to_string(),
                spec: None,
                status: None,
            }),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // missing body
    let err = bridge_ports
        .create_bridge_port(CreateBridgePortRequest { bridge_port: None })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // negative VF count
    let err = devices.set_num_vfs(VfCount { vf_cnt: -1 }).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    t.daemon.stop().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn delete_bridge_port_allow_missing_over_socket() {
    let t = test_daemon();
    let listener = t.daemon.listen().await.unwrap();
    let serving = tokio::spawn(t.daemon.clone().serve(listener));

    let channel = connect(t.socket.clone()).await;
    let mut lifecycle = LifeCycleServiceClient::new(channel.clone());
    let mut bridge_ports = BridgePortServiceClient::new(channel);

    lifecycle
        .init(InitRequest { dpu_mode: true })
        .await
        .unwrap();

    // never attached: tolerated with allow_missing, NotFound without
    bridge_ports
        .delete_bridge_port(DeleteBridgePortRequest {
            name: "host0-0".to_string(),
            allow_missing: true,
        })
        .await
        .unwrap();
    let err = bridge_ports
        .delete_bridge_port(DeleteBridgePortRequest {
            name: "host0-0".to_string(),
            allow_missing: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    t.daemon.stop().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn host_mode_session_controls_vf_count() {
    let t = test_daemon();
    let listener = t.daemon.listen().await.unwrap();
    let serving = tokio::spawn(t.daemon.clone().serve(listener));

    let channel = connect(t.socket.clone()).await;
    let mut lifecycle = LifeCycleServiceClient::new(channel.clone());
    let mut devices = DeviceServiceClient::new(channel);

    let ip_port = lifecycle
        .init(InitRequest { dpu_mode: false })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(ip_port.ip, "[fe80::1%25enP3p1s0]");

    let count = devices
        .set_num_vfs(VfCount { vf_cnt: 8 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(count.vf_cnt, 8);

    t.daemon.stop().await.unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_dpu_init_stops_the_server() {
    let t = test_daemon();
    t.ops.fail_create_of("nf_interface1");
    let listener = t.daemon.listen().await.unwrap();
    let serving = tokio::spawn(t.daemon.clone().serve(listener));

    let channel = connect(t.socket.clone()).await;
    let mut lifecycle = LifeCycleServiceClient::new(channel);

    let err = lifecycle
        .init(InitRequest { dpu_mode: true })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);

    // the failed Init shuts the daemon down on its own
    serving.await.unwrap().unwrap();
    assert_eq!(t.daemon.state(), LifecycleState::Stopped);
    // the half-provisioned pair was rolled back
    assert!(!t.ops.link_names().contains(&"nf_interface0".to_string()));
}

#[tokio::test]
async fn listen_replaces_stale_socket() {
    let t = test_daemon();
    std::fs::write(&t.socket, b"").unwrap();

    let listener = t.daemon.listen().await.unwrap();
    drop(listener);
    assert_eq!(t.daemon.state(), LifecycleState::Listening);
}

#[tokio::test]
async fn serve_cannot_run_twice() {
    let t = test_daemon();
    let listener = t.daemon.listen().await.unwrap();
    let serving = tokio::spawn(t.daemon.clone().serve(listener));

    // second listener on a fresh path; the daemon refuses anyway
    let second = t.daemon.listen().await;
    if let Ok(listener) = second {
        assert!(t.daemon.clone().serve(listener).await.is_err());
    }

    t.daemon.stop().await.unwrap();
    serving.await.unwrap().unwrap();
}
