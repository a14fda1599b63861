//! 单条链路的 GATT 客户端状态机
//!
//! Opening → Connected → Discovering → Ready → Disconnected / Closed
//!
//! 服务发现完成后在只读特征上开启通知，通知数据作为消息交给拥有者；
//! 只有 Ready 状态下才会向可写特征写入。服务发现失败后链路停在
//! `DiscoveryFailed`，由拥有者决定是否断开。

use log::{debug, info, warn};
use uuid::Uuid;

use crate::config::CentralConfig;
use crate::error::IotoothError;
use crate::event::{CentralCallback, CentralState, Delivery, DropReason};
use crate::transport::{
    CentralTransport, DeviceAddress, DiscoveredDevice, LinkEvent, LinkId, LinkStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// 链路已打开，等待连接
    Opening,
    Connecting,
    /// 已连接，正在发现服务
    Discovering,
    /// 服务发现完成
    Ready { readonly: bool, writable: bool },
    /// 服务发现失败，不再收发
    DiscoveryFailed,
    Disconnecting,
    Disconnected,
    /// 传输层资源已释放
    Closed,
}

pub struct CentralLinkHandler {
    device: DiscoveredDevice,
    link: LinkId,
    service_uuid: Uuid,
    readonly_uuid: Uuid,
    writable_uuid: Uuid,
    phase: LinkPhase,
}

impl CentralLinkHandler {
    /// 打开到设备的链路；传输层返回空句柄时不创建处理器
    pub fn open<T: CentralTransport>(
        transport: &mut T,
        device: &DiscoveredDevice,
        config: &CentralConfig,
    ) -> Option<Self> {
        let link = transport.open_link(&device.address)?;
        debug!("Link {:?} opened to {}", link, device.address);
        Some(Self {
            device: device.clone(),
            link,
            service_uuid: config.service_uuid,
            readonly_uuid: config.readonly_uuid,
            writable_uuid: config.writable_uuid,
            phase: LinkPhase::Opening,
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.device.address
    }

    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.phase, LinkPhase::Ready { .. })
    }

    pub fn handle_event<T: CentralTransport>(
        &mut self,
        transport: &mut T,
        event: LinkEvent,
        callback: &dyn CentralCallback,
    ) {
        if self.phase == LinkPhase::Closed {
            debug!("Event on closed link to {}: {:?}", self.device.address, event);
            return;
        }

        match event {
            LinkEvent::StateChanged(status) => self.on_status(transport, status, callback),
            LinkEvent::ServicesDiscovered { characteristics } => {
                if self.phase != LinkPhase::Discovering {
                    debug!("Unexpected discovery result for {}", self.device.address);
                    return;
                }
                let readonly = characteristics.contains(&self.readonly_uuid);
                let writable = characteristics.contains(&self.writable_uuid);
                if readonly {
                    transport.set_notify(self.link, self.readonly_uuid, true);
                } else {
                    warn!(
                        "{} has no readonly characteristic {}",
                        self.device.address, self.readonly_uuid
                    );
                }
                if !writable {
                    warn!(
                        "{} has no writable characteristic {}",
                        self.device.address, self.writable_uuid
                    );
                }
                self.phase = LinkPhase::Ready { readonly, writable };
                info!("Link to {} ready", self.device.address);
                callback.on_state(CentralState::ServicesDiscovered, &self.device.address);
            }
            LinkEvent::DiscoveryFailed => {
                if self.phase != LinkPhase::Discovering {
                    debug!("Unexpected discovery failure for {}", self.device.address);
                    return;
                }
                warn!("Service discovery failed for {}", self.device.address);
                self.phase = LinkPhase::DiscoveryFailed;
                callback.on_error(&IotoothError::DiscoveryFailed(self.device.address.clone()));
            }
            LinkEvent::Notification {
                characteristic,
                value,
            }
            | LinkEvent::ReadCompleted {
                characteristic,
                value,
            } => {
                if characteristic == self.readonly_uuid {
                    callback.on_message(&self.device.address, &value);
                } else {
                    debug!(
                        "Data on unexpected characteristic {} from {}",
                        characteristic, self.device.address
                    );
                }
            }
            LinkEvent::WriteCompleted { characteristic, ok } => {
                if !ok {
                    warn!(
                        "Write to {} on {} failed",
                        characteristic, self.device.address
                    );
                }
            }
        }
    }

    fn on_status<T: CentralTransport>(
        &mut self,
        transport: &mut T,
        status: LinkStatus,
        callback: &dyn CentralCallback,
    ) {
        let state = match status {
            LinkStatus::Connecting => {
                self.phase = LinkPhase::Connecting;
                CentralState::Connecting
            }
            LinkStatus::Connected => {
                self.phase = LinkPhase::Discovering;
                transport.discover_services(self.link, self.service_uuid);
                CentralState::Connected
            }
            LinkStatus::Disconnecting => {
                self.phase = LinkPhase::Disconnecting;
                CentralState::Disconnecting
            }
            LinkStatus::Disconnected => {
                self.phase = LinkPhase::Disconnected;
                CentralState::Disconnected
            }
        };
        debug!("Link to {} -> {:?}", self.device.address, self.phase);
        callback.on_state(state, &self.device.address);
    }

    /// 写入对端的可写特征
    pub fn send<T: CentralTransport>(&mut self, transport: &mut T, data: &[u8]) -> Delivery {
        match self.phase {
            LinkPhase::Ready { writable: true, .. } => {
                transport.write_characteristic(self.link, self.writable_uuid, data);
                Delivery::Sent
            }
            LinkPhase::Ready { writable: false, .. } => {
                Delivery::Dropped(DropReason::CharacteristicMissing)
            }
            _ => Delivery::Dropped(DropReason::LinkNotReady(self.device.address.clone())),
        }
    }

    /// 主动读取只读特征，结果作为消息回调
    pub fn read<T: CentralTransport>(&mut self, transport: &mut T) -> Delivery {
        match self.phase {
            LinkPhase::Ready { readonly: true, .. } => {
                transport.read_characteristic(self.link, self.readonly_uuid);
                Delivery::Sent
            }
            LinkPhase::Ready { readonly: false, .. } => {
                Delivery::Dropped(DropReason::CharacteristicMissing)
            }
            _ => Delivery::Dropped(DropReason::LinkNotReady(self.device.address.clone())),
        }
    }

    /// 释放传输层资源（含通知订阅），可重复调用
    pub fn close<T: CentralTransport>(&mut self, transport: &mut T) {
        if self.phase == LinkPhase::Closed {
            return;
        }
        transport.close_link(self.link);
        self.phase = LinkPhase::Closed;
        debug!("Link {:?} to {} closed", self.link, self.device.address);
    }
}
