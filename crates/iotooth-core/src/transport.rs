//! 传输层边界
//!
//! 状态机只通过这里定义的两个 trait 与射频交互：
//!
//! - [`PeripheralTransport`]: 广播控制、GATT Server、特征通知与写响应
//! - [`CentralTransport`]: 扫描、链路打开/关闭、特征读写与通知订阅
//!
//! 所有请求都是"发出即返回"，结果通过 [`EventSender`] 异步送回状态机的收件箱。
//! 每个事件都带有身份标识（会话 epoch、扫描 ID、链路 ID），
//! 状态机据此丢弃已经过期的事件。

use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// 远端设备地址，注册表的键
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 外设会话代数。每次 disable 递增，旧代数的事件一律视为过期。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    #[must_use]
    pub fn next(self) -> Self {
        Epoch(self.0.wrapping_add(1))
    }
}

/// 扫描窗口标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(pub u64);

/// 传输层分配的链路句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

/// GATT Server 句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerHandle(pub u64);

/// 远端读写请求标识，用于回送响应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// 链路连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// 特征属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    /// 只读 + 通知（外设 -> 中心）
    pub const READ_NOTIFY: Self = Self {
        read: true,
        write: false,
        write_without_response: false,
        notify: true,
    };

    /// 可写 + 通知（中心 -> 外设）
    pub const WRITE_NOTIFY: Self = Self {
        read: false,
        write: true,
        write_without_response: false,
        notify: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// GATT 服务定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDefinition> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// 写/读请求的响应状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
    Failure,
}

impl GattStatus {
    /// ATT 协议错误码
    pub fn code(self) -> u8 {
        match self {
            GattStatus::Success => 0x00,
            GattStatus::ReadNotPermitted => 0x02,
            GattStatus::WriteNotPermitted => 0x03,
            GattStatus::InvalidOffset => 0x07,
            GattStatus::Failure => 0x0e,
        }
    }
}

/// 广播启动失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseFailure {
    DataTooLarge,
    TooManyAdvertisers,
    AlreadyStarted,
    InternalError,
    FeatureUnsupported,
}

impl AdvertiseFailure {
    pub fn code(self) -> i32 {
        match self {
            AdvertiseFailure::DataTooLarge => 1,
            AdvertiseFailure::TooManyAdvertisers => 2,
            AdvertiseFailure::AlreadyStarted => 3,
            AdvertiseFailure::InternalError => 4,
            AdvertiseFailure::FeatureUnsupported => 5,
        }
    }
}

impl fmt::Display for AdvertiseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdvertiseFailure::DataTooLarge => "advertise data too large",
            AdvertiseFailure::TooManyAdvertisers => "too many advertisers",
            AdvertiseFailure::AlreadyStarted => "already started",
            AdvertiseFailure::InternalError => "internal error",
            AdvertiseFailure::FeatureUnsupported => "feature unsupported",
        };
        f.write_str(s)
    }
}

/// 扫描失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    AlreadyStarted,
    RegistrationFailed,
    InternalError,
    FeatureUnsupported,
}

impl ScanFailure {
    pub fn code(self) -> i32 {
        match self {
            ScanFailure::AlreadyStarted => 1,
            ScanFailure::RegistrationFailed => 2,
            ScanFailure::InternalError => 3,
            ScanFailure::FeatureUnsupported => 4,
        }
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanFailure::AlreadyStarted => "scan already started",
            ScanFailure::RegistrationFailed => "application registration failed",
            ScanFailure::InternalError => "internal error",
            ScanFailure::FeatureUnsupported => "feature unsupported",
        };
        f.write_str(s)
    }
}

/// 广播参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseParams {
    pub service_uuid: Uuid,
    pub connectable: bool,
    pub local_name: Option<String>,
    pub include_tx_power: bool,
}

/// 扫描发现的设备（一次广播包对应一条）
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<DeviceAddress>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: None,
            services: Vec::new(),
        }
    }
}

/// 外设角色的传输事件
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralTransportEvent {
    AdvertiseStarted,
    AdvertiseFailed(AdvertiseFailure),
    ConnectionStateChanged {
        device: DeviceAddress,
        status: LinkStatus,
    },
    WriteRequest {
        request: RequestId,
        device: DeviceAddress,
        characteristic: Uuid,
        offset: usize,
        value: Vec<u8>,
    },
    ReadRequest {
        request: RequestId,
        device: DeviceAddress,
        characteristic: Uuid,
        offset: usize,
    },
}

/// 带会话代数的事件
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged<E> {
    pub epoch: Epoch,
    pub event: E,
}

/// 单条链路上的事件
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkStatus),
    /// 目标服务下发现的特征 UUID
    ServicesDiscovered { characteristics: Vec<Uuid> },
    DiscoveryFailed,
    Notification { characteristic: Uuid, value: Vec<u8> },
    ReadCompleted { characteristic: Uuid, value: Vec<u8> },
    WriteCompleted { characteristic: Uuid, ok: bool },
}

/// 中心角色的传输事件
#[derive(Debug, Clone, PartialEq)]
pub enum CentralTransportEvent {
    ScanResult {
        scan: ScanId,
        device: DiscoveredDevice,
    },
    ScanFailed {
        scan: ScanId,
        failure: ScanFailure,
    },
    Link {
        address: DeviceAddress,
        link: LinkId,
        event: LinkEvent,
    },
}

/// 传输层向状态机投递事件的句柄
///
/// 无界通道：射频回调线程永远不会因投递而阻塞。
/// 接收端关闭（状态机已销毁）后的投递会被静默丢弃。
pub struct EventSender<E> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E: fmt::Debug> EventSender<E> {
    /// 投递事件，接收端已关闭时返回 `false`
    pub fn send(&self, event: E) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                trace!("Event dropped, receiver closed: {:?}", event);
                false
            }
        }
    }
}

impl<E: fmt::Debug> EventSender<Tagged<E>> {
    pub fn send_tagged(&self, epoch: Epoch, event: E) -> bool {
        self.send(Tagged { epoch, event })
    }
}

/// 创建事件通道
pub fn event_channel<E>() -> (EventSender<E>, mpsc::UnboundedReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

pub type PeripheralEventSender = EventSender<Tagged<PeripheralTransportEvent>>;
pub type CentralEventSender = EventSender<CentralTransportEvent>;

/// 外设角色的射频能力集合
pub trait PeripheralTransport: Send {
    /// 绑定事件通道，会话构造时调用一次
    fn bind(&mut self, events: PeripheralEventSender);

    /// 本地射频是否可用（必要时尝试开启）
    fn radio_available(&mut self) -> bool;

    /// 开始广播，结果以 `AdvertiseStarted` / `AdvertiseFailed` 返回
    fn start_advertising(&mut self, epoch: Epoch, params: &AdvertiseParams);

    fn stop_advertising(&mut self);

    /// 打开 GATT Server，之后的连接与读写事件都带上 `epoch`
    fn open_gatt_server(&mut self, epoch: Epoch) -> Result<ServerHandle, TransportError>;

    fn clear_services(&mut self, server: ServerHandle);

    fn add_service(&mut self, server: ServerHandle, service: &ServiceDefinition);

    fn close_gatt_server(&mut self, server: ServerHandle);

    /// 更新特征值并通知已连接设备
    fn notify_characteristic(
        &mut self,
        server: ServerHandle,
        device: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
    );

    fn send_response(
        &mut self,
        server: ServerHandle,
        request: RequestId,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    );
}

/// 中心角色的射频能力集合
pub trait CentralTransport: Send {
    fn bind(&mut self, events: CentralEventSender);

    fn radio_available(&mut self) -> bool;

    /// 按服务 UUID 过滤扫描，替换当前正在进行的扫描
    fn start_scan(&mut self, scan: ScanId, filter: Uuid);

    /// 停止扫描；`scan` 不是当前扫描时忽略
    fn stop_scan(&mut self, scan: ScanId);

    /// 打开到设备的链路，无法打开时返回 `None`
    fn open_link(&mut self, address: &DeviceAddress) -> Option<LinkId>;

    /// 释放链路的全部资源（含通知订阅），可重复调用。
    /// 同一地址上可能已经打开了新链路，此时不得断开物理连接。
    fn close_link(&mut self, link: LinkId);

    /// 发现 `service` 下的特征，结果以 `ServicesDiscovered` 返回
    fn discover_services(&mut self, link: LinkId, service: Uuid);

    fn read_characteristic(&mut self, link: LinkId, characteristic: Uuid);

    fn write_characteristic(&mut self, link: LinkId, characteristic: Uuid, value: &[u8]);

    fn set_notify(&mut self, link: LinkId, characteristic: Uuid, enabled: bool);
}
