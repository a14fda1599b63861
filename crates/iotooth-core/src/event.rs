//! 事件回调
//!
//! 状态机通过这里的回调 trait 通知拥有者。所有回调都在状态机自己的
//! 事件循环上调用，观察者不会遇到并发或重入的通知。
//!
//! 每个回调 trait 都为 `mpsc::UnboundedSender<..Event>` 提供了实现，
//! 便于把事件转发到 UI 或测试代码。

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{IotoothError, Result};
use crate::transport::{DeviceAddress, DiscoveredDevice, ScanFailure};

/// 外设状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Disconnected,
    Advertising,
    Connecting,
    Connected,
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeripheralState::Disconnected => "DISCONNECTED",
            PeripheralState::Advertising => "ADVERTISING",
            PeripheralState::Connecting => "CONNECTING",
            PeripheralState::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

/// 中心角色的链路级状态通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CentralState {
    OpenedGatt,
    Connecting,
    Connected,
    ServicesDiscovered,
    Disconnecting,
    Disconnected,
}

impl fmt::Display for CentralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CentralState::OpenedGatt => "OPENED_GATT",
            CentralState::Connecting => "CONNECTING",
            CentralState::Connected => "CONNECTED",
            CentralState::ServicesDiscovered => "SERVICES_DISCOVERED",
            CentralState::Disconnecting => "DISCONNECTING",
            CentralState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// 消息被丢弃的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// 外设当前没有已连接的中心设备
    NotConnected,
    /// 特征尚未注册或未被发现
    CharacteristicMissing,
    /// 注册表中没有该地址
    UnknownAddress(DeviceAddress),
    /// 链路尚未完成服务发现
    LinkNotReady(DeviceAddress),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NotConnected => write!(f, "no connected device"),
            DropReason::CharacteristicMissing => write!(f, "characteristic not available"),
            DropReason::UnknownAddress(addr) => write!(f, "no link for {addr}"),
            DropReason::LinkNotReady(addr) => write!(f, "link to {addr} is not ready"),
        }
    }
}

/// 发送结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped(DropReason),
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// 无法投递时的处理策略
///
/// - `BestEffort`: 静默丢弃，返回 `Ok(Delivery::Dropped(..))`
/// - `Strict`: 丢弃视为错误，返回 `Err`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    #[default]
    BestEffort,
    Strict,
}

impl DeliveryPolicy {
    pub fn is_strict(self) -> bool {
        self == DeliveryPolicy::Strict
    }

    /// 按策略把 `Delivery` 转成调用结果
    pub fn resolve(self, delivery: Delivery) -> Result<Delivery> {
        match (self, delivery) {
            (DeliveryPolicy::Strict, Delivery::Dropped(reason)) => {
                Err(IotoothError::Dropped(reason))
            }
            (_, delivery) => Ok(delivery),
        }
    }
}

/// 外设拥有者的回调
pub trait PeripheralCallback: Send {
    /// 状态变化，`context` 为连接设备地址或广播的服务 UUID
    fn on_state(&self, state: PeripheralState, context: Option<&str>);
    /// 收到中心设备写入的数据
    fn on_message(&self, offset: usize, data: &[u8]);
    /// 可恢复的错误（射频不可用、广播失败）
    fn on_error(&self, error: &IotoothError);
}

/// 中心拥有者的回调
pub trait CentralCallback: Send {
    fn on_state(&self, state: CentralState, address: &DeviceAddress);
    /// 收到外设的通知数据
    fn on_message(&self, address: &DeviceAddress, data: &[u8]);
    fn on_error(&self, _error: &IotoothError) {}
}

/// 单次扫描的回调
pub trait ScanCallback: Send {
    fn on_scan_started(&self);
    fn on_scan_result(&self, device: &DiscoveredDevice);
    fn on_scan_stopped(&self);
    /// 仅在 `DeliveryPolicy::Strict` 下调用
    fn on_scan_failed(&self, _failure: ScanFailure) {}
}

/// 外设事件（通道形式）
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    StateChanged {
        state: PeripheralState,
        context: Option<String>,
    },
    Message {
        offset: usize,
        data: Vec<u8>,
    },
    Error(IotoothError),
}

impl PeripheralCallback for mpsc::UnboundedSender<PeripheralEvent> {
    fn on_state(&self, state: PeripheralState, context: Option<&str>) {
        let _ = self.send(PeripheralEvent::StateChanged {
            state,
            context: context.map(str::to_string),
        });
    }

    fn on_message(&self, offset: usize, data: &[u8]) {
        let _ = self.send(PeripheralEvent::Message {
            offset,
            data: data.to_vec(),
        });
    }

    fn on_error(&self, error: &IotoothError) {
        let _ = self.send(PeripheralEvent::Error(error.clone()));
    }
}

/// 中心事件（通道形式）
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    StateChanged {
        state: CentralState,
        address: DeviceAddress,
    },
    Message {
        address: DeviceAddress,
        data: Vec<u8>,
    },
    Error(IotoothError),
}

impl CentralCallback for mpsc::UnboundedSender<CentralEvent> {
    fn on_state(&self, state: CentralState, address: &DeviceAddress) {
        let _ = self.send(CentralEvent::StateChanged {
            state,
            address: address.clone(),
        });
    }

    fn on_message(&self, address: &DeviceAddress, data: &[u8]) {
        let _ = self.send(CentralEvent::Message {
            address: address.clone(),
            data: data.to_vec(),
        });
    }

    fn on_error(&self, error: &IotoothError) {
        let _ = self.send(CentralEvent::Error(error.clone()));
    }
}

/// 扫描事件（通道形式）
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Started,
    Result(DiscoveredDevice),
    Stopped,
    Failed(ScanFailure),
}

impl ScanCallback for mpsc::UnboundedSender<ScanEvent> {
    fn on_scan_started(&self) {
        let _ = self.send(ScanEvent::Started);
    }

    fn on_scan_result(&self, device: &DiscoveredDevice) {
        let _ = self.send(ScanEvent::Result(device.clone()));
    }

    fn on_scan_stopped(&self) {
        let _ = self.send(ScanEvent::Stopped);
    }

    fn on_scan_failed(&self, failure: ScanFailure) {
        let _ = self.send(ScanEvent::Failed(failure));
    }
}
