//! 集成测试 - 外设会话生命周期
//!
//! 用记录调用的传输桩驱动 [`PeripheralSession`]，模拟射频回调的到达顺序。

mod common;

use common::{PeripheralCall, RecordingPeripheral, collect};
use iotooth_core::config::{DEFAULT_READONLY_UUID, DEFAULT_SERVICE_UUID, DEFAULT_WRITABLE_UUID};
use iotooth_core::transport::{
    CharacteristicProperties, GattStatus, LinkStatus, PeripheralTransportEvent, RequestId,
};
use iotooth_core::{
    Delivery, DeliveryPolicy, DropReason, IotoothError, PeripheralCommand, PeripheralConfig,
    PeripheralEvent, PeripheralSession, PeripheralState,
};
use tokio::sync::mpsc;

const CENTRAL: &str = "AA:BB:CC:DD:EE:01";

type Session = PeripheralSession<RecordingPeripheral>;

fn session_with(
    config: PeripheralConfig,
    transport: RecordingPeripheral,
) -> (Session, mpsc::UnboundedReceiver<PeripheralEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PeripheralSession::new(config, transport, tx), rx)
}

fn session() -> (Session, mpsc::UnboundedReceiver<PeripheralEvent>) {
    session_with(
        PeripheralConfig::new(DEFAULT_SERVICE_UUID),
        RecordingPeripheral::default(),
    )
}

fn push(session: &Session, event: PeripheralTransportEvent) {
    session.event_sender().send_tagged(session.epoch(), event);
}

fn connection(status: LinkStatus) -> PeripheralTransportEvent {
    PeripheralTransportEvent::ConnectionStateChanged {
        device: CENTRAL.into(),
        status,
    }
}

fn state(state: PeripheralState, context: Option<&str>) -> PeripheralEvent {
    PeripheralEvent::StateChanged {
        state,
        context: context.map(str::to_string),
    }
}

/// 启用并确认广播，返回时服务已注册
fn advertising() -> (Session, mpsc::UnboundedReceiver<PeripheralEvent>) {
    let (mut session, mut rx) = session();
    session.enable();
    push(&session, PeripheralTransportEvent::AdvertiseStarted);
    session.drain();
    collect(&mut rx);
    (session, rx)
}

/// 已连接一个中心设备
fn connected() -> (Session, mpsc::UnboundedReceiver<PeripheralEvent>) {
    let (mut session, mut rx) = advertising();
    push(&session, connection(LinkStatus::Connected));
    session.drain();
    collect(&mut rx);
    (session, rx)
}

/// 启用后广播并注册一个服务，包含只读和可写两个特征
#[test]
fn test_enable_advertises_and_registers_service() {
    let (mut session, mut rx) = session();
    session.enable();

    let service = DEFAULT_SERVICE_UUID.to_string();
    assert_eq!(session.state(), PeripheralState::Advertising);
    assert_eq!(
        collect(&mut rx),
        vec![state(PeripheralState::Advertising, Some(&service))]
    );
    assert!(session.transport().advertising);
    assert!(!session.services_registered());

    push(&session, PeripheralTransportEvent::AdvertiseStarted);
    session.drain();

    assert!(session.services_registered());
    let services = &session.transport().services;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid, DEFAULT_SERVICE_UUID);
    assert!(services[0].primary);
    assert_eq!(
        services[0]
            .characteristic(DEFAULT_READONLY_UUID)
            .map(|c| c.properties),
        Some(CharacteristicProperties::READ_NOTIFY)
    );
    assert_eq!(
        services[0]
            .characteristic(DEFAULT_WRITABLE_UUID)
            .map(|c| c.properties),
        Some(CharacteristicProperties::WRITE_NOTIFY)
    );
}

/// 连接后进入 CONNECTED，停止广播，上下文为中心设备地址
#[test]
fn test_connect_stops_advertising() {
    let (mut session, mut rx) = advertising();
    push(&session, connection(LinkStatus::Connected));
    session.drain();

    assert_eq!(session.state(), PeripheralState::Connected);
    assert_eq!(
        collect(&mut rx),
        vec![state(PeripheralState::Connected, Some(CENTRAL))]
    );
    assert!(!session.transport().advertising);
    assert_eq!(session.connected_device(), Some(&CENTRAL.into()));
}

/// 中心写入 "hi" 后以 offset 0 交给拥有者，并回送成功响应
#[test]
fn test_write_delivered_and_acknowledged() {
    let (mut session, mut rx) = connected();
    push(
        &session,
        PeripheralTransportEvent::WriteRequest {
            request: RequestId(7),
            device: CENTRAL.into(),
            characteristic: DEFAULT_WRITABLE_UUID,
            offset: 0,
            value: b"hi".to_vec(),
        },
    );
    session.drain();

    assert_eq!(
        collect(&mut rx),
        vec![PeripheralEvent::Message {
            offset: 0,
            data: b"hi".to_vec()
        }]
    );
    assert_eq!(
        session.transport().calls.last(),
        Some(&PeripheralCall::Response {
            request: RequestId(7),
            status: GattStatus::Success,
            offset: 0,
            value: b"hi".to_vec(),
        })
    );
}

#[test]
fn test_write_to_readonly_is_rejected() {
    let (mut session, mut rx) = connected();
    push(
        &session,
        PeripheralTransportEvent::WriteRequest {
            request: RequestId(1),
            device: CENTRAL.into(),
            characteristic: DEFAULT_READONLY_UUID,
            offset: 0,
            value: b"nope".to_vec(),
        },
    );
    session.drain();

    assert!(collect(&mut rx).is_empty());
    assert_eq!(
        session.transport().responses(),
        vec![(GattStatus::WriteNotPermitted, Vec::new())]
    );
}

/// 发送的数据通过只读特征通知，远端读取时返回同一个值
#[test]
fn test_send_notifies_and_updates_readonly_value() {
    let (mut session, _rx) = connected();
    assert_eq!(session.send_text("hello").unwrap(), Delivery::Sent);
    assert_eq!(
        session.transport().calls.last(),
        Some(&PeripheralCall::Notify {
            device: CENTRAL.into(),
            characteristic: DEFAULT_READONLY_UUID,
            value: b"hello".to_vec(),
        })
    );

    for (request, offset) in [(1, 0), (2, 3), (3, 9)] {
        push(
            &session,
            PeripheralTransportEvent::ReadRequest {
                request: RequestId(request),
                device: CENTRAL.into(),
                characteristic: DEFAULT_READONLY_UUID,
                offset,
            },
        );
    }
    session.drain();

    assert_eq!(
        session.transport().responses(),
        vec![
            (GattStatus::Success, b"hello".to_vec()),
            (GattStatus::Success, b"lo".to_vec()),
            (GattStatus::InvalidOffset, Vec::new()),
        ]
    );
}

/// 只读特征以外的读请求被拒绝
#[test]
fn test_read_of_other_characteristic_rejected() {
    let (mut session, _rx) = connected();
    push(
        &session,
        PeripheralTransportEvent::ReadRequest {
            request: RequestId(7),
            device: CENTRAL.into(),
            characteristic: DEFAULT_WRITABLE_UUID,
            offset: 0,
        },
    );
    session.drain();

    assert_eq!(
        session.transport().calls.last(),
        Some(&PeripheralCall::Response {
            request: RequestId(7),
            status: GattStatus::ReadNotPermitted,
            offset: 0,
            value: Vec::new(),
        })
    );
}

/// 连接建立前链路断开：回到 ADVERTISING，广播未曾停止
#[test]
fn test_connecting_drop_returns_to_advertising() {
    let (mut session, mut rx) = advertising();
    let start = PeripheralCall::StartAdvertising(session.epoch());
    let starts_before = session.transport().count(&start);
    let stops_before = session.transport().count(&PeripheralCall::StopAdvertising);

    push(&session, connection(LinkStatus::Connecting));
    push(&session, connection(LinkStatus::Disconnected));
    session.drain();

    assert_eq!(
        collect(&mut rx),
        vec![
            state(PeripheralState::Connecting, Some(CENTRAL)),
            state(
                PeripheralState::Advertising,
                Some(&DEFAULT_SERVICE_UUID.to_string())
            ),
        ]
    );
    assert_eq!(session.state(), PeripheralState::Advertising);
    assert!(session.transport().advertising);
    assert_eq!(session.transport().count(&start), starts_before);
    assert_eq!(
        session.transport().count(&PeripheralCall::StopAdvertising),
        stops_before
    );
}

/// 断开后依次报告 DISCONNECTED 和 ADVERTISING，并重新广播
#[test]
fn test_disconnect_resumes_advertising() {
    let (mut session, mut rx) = connected();
    push(&session, connection(LinkStatus::Disconnected));
    session.drain();

    let service = DEFAULT_SERVICE_UUID.to_string();
    assert_eq!(
        collect(&mut rx),
        vec![
            state(PeripheralState::Disconnected, None),
            state(PeripheralState::Advertising, Some(&service)),
        ]
    );
    assert_eq!(session.state(), PeripheralState::Advertising);
    assert!(session.transport().advertising);
    assert!(session.connected_device().is_none());

    // 恢复后的广播确认会重建服务
    push(&session, PeripheralTransportEvent::AdvertiseStarted);
    session.drain();
    assert!(session.services_registered());
    assert_eq!(session.transport().services.len(), 1);
}

#[test]
fn test_disconnect_of_other_device_ignored() {
    let (mut session, mut rx) = connected();
    push(
        &session,
        PeripheralTransportEvent::ConnectionStateChanged {
            device: "11:11:11:11:11:11".into(),
            status: LinkStatus::Disconnected,
        },
    );
    session.drain();

    assert_eq!(session.state(), PeripheralState::Connected);
    assert!(collect(&mut rx).is_empty());
}

/// 任何状态下 disable 都回到 DISCONNECTED 且不保留服务
#[test]
fn test_disable_from_every_state() {
    let setups: [fn() -> (Session, mpsc::UnboundedReceiver<PeripheralEvent>); 3] =
        [session, advertising, connected];

    for setup in setups {
        let (mut session, mut rx) = setup();
        session.disable();

        assert_eq!(session.state(), PeripheralState::Disconnected);
        assert!(!session.services_registered());
        assert!(session.transport().services.is_empty());
        assert!(session.transport().server.is_none());
        assert!(!session.transport().advertising);
        assert_eq!(
            collect(&mut rx).last(),
            Some(&state(PeripheralState::Disconnected, None))
        );
    }
}

#[test]
fn test_disable_closes_server_once() {
    let (mut session, _rx) = connected();
    session.disable();
    session.disable();

    assert_eq!(session.transport().count(&PeripheralCall::CloseServer), 1);
}

/// 未连接时发送不会产生通知
#[test]
fn test_send_without_connection_is_dropped() {
    for setup in [session, advertising] {
        let (mut session, _rx) = setup();
        assert_eq!(
            session.send(b"x").unwrap(),
            Delivery::Dropped(DropReason::NotConnected)
        );
        assert_eq!(session.transport().notifications(), 0);
    }
}

#[test]
fn test_strict_policy_reports_dropped_send() {
    let (mut session, _rx) = session_with(
        PeripheralConfig::new(DEFAULT_SERVICE_UUID).with_delivery(DeliveryPolicy::Strict),
        RecordingPeripheral::default(),
    );
    session.enable();

    assert_eq!(
        session.send(b"x"),
        Err(IotoothError::Dropped(DropReason::NotConnected))
    );
}

/// 连接在服务注册之前建立时，发送因特征缺失而丢弃
#[test]
fn test_send_before_service_registered() {
    let (mut session, _rx) = session();
    session.enable();
    push(&session, connection(LinkStatus::Connected));
    session.drain();

    assert_eq!(session.state(), PeripheralState::Connected);
    assert_eq!(
        session.send(b"x").unwrap(),
        Delivery::Dropped(DropReason::CharacteristicMissing)
    );
}

/// GATT Server 打不开时停止广播并回到 DISCONNECTED
#[test]
fn test_server_open_failure() {
    let transport = RecordingPeripheral {
        fail_open: true,
        ..Default::default()
    };
    let (mut session, mut rx) = session_with(PeripheralConfig::default(), transport);
    session.enable();
    collect(&mut rx);

    push(&session, PeripheralTransportEvent::AdvertiseStarted);
    session.drain();

    let events = collect(&mut rx);
    assert!(matches!(
        events.first(),
        Some(PeripheralEvent::Error(IotoothError::Transport(_)))
    ));
    assert_eq!(
        events.last(),
        Some(&state(PeripheralState::Disconnected, None))
    );
    assert!(!session.transport().advertising);
    assert_eq!(session.state(), PeripheralState::Disconnected);
}

/// enable 在已连接时不会重新广播
#[test]
fn test_enable_while_connected_keeps_link() {
    let (mut session, mut rx) = connected();
    session.enable();

    assert_eq!(session.state(), PeripheralState::Connected);
    assert!(!session.transport().advertising);
    assert!(collect(&mut rx).is_empty());
}

#[test]
fn test_enable_while_advertising_restarts_advertising() {
    let (mut session, _rx) = advertising();
    let start = PeripheralCall::StartAdvertising(session.epoch());
    let starts_before = session.transport().count(&start);
    session.enable();

    assert_eq!(session.state(), PeripheralState::Advertising);
    assert_eq!(session.transport().count(&start), starts_before + 1);
}

/// 命令通道关闭后会话自行 disable
#[tokio::test]
async fn test_run_loop_shuts_down_on_close() {
    let (session, mut rx) = session();
    let events = session.event_sender();
    let epoch = session.epoch();
    let (commands, inbox) = mpsc::channel(8);

    let task = tokio::spawn(session.run(inbox));
    commands.send(PeripheralCommand::Enable).await.unwrap();
    events.send_tagged(epoch, PeripheralTransportEvent::AdvertiseStarted);
    events.send_tagged(epoch, connection(LinkStatus::Connected));
    commands
        .send(PeripheralCommand::SendText("ping".into()))
        .await
        .unwrap();
    drop(commands);

    let session = task.await.unwrap();
    assert_eq!(session.state(), PeripheralState::Disconnected);
    assert!(session.transport().server.is_none());
    assert_eq!(
        collect(&mut rx).last(),
        Some(&state(PeripheralState::Disconnected, None))
    );
}
