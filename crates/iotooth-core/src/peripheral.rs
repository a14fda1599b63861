//! 外设会话 - 广播 + 单连接 GATT Server
//!
//! 状态机（初始为 DISCONNECTED）：
//!
//! ```text
//! DISCONNECTED --enable()--------------> ADVERTISING
//! ADVERTISING  --链路 connecting--------> CONNECTING
//! ADVERTISING/CONNECTING --链路建立-----> CONNECTED   (停止广播)
//! CONNECTED    --链路断开---------------> ADVERTISING (自动恢复广播)
//! 任意状态     --disable()--------------> DISCONNECTED
//! ```
//!
//! 命令（enable/disable/send）在拥有者的上下文中同步执行；传输事件进入
//! 收件箱，由同一上下文的 [`PeripheralSession::process_next`] /
//! [`PeripheralSession::run`] 逐个消费，状态字段本身不需要加锁。

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::PeripheralConfig;
use crate::error::{IotoothError, Result};
use crate::event::{Delivery, DropReason, PeripheralCallback, PeripheralState};
use crate::transport::{
    DeviceAddress, Epoch, GattStatus, LinkStatus, PeripheralEventSender, PeripheralTransport,
    PeripheralTransportEvent, RequestId, ServerHandle, Tagged, event_channel,
};

/// 会话阶段，只携带该阶段有效的数据
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Advertising,
    Connecting { device: DeviceAddress },
    Connected { device: DeviceAddress },
}

impl Phase {
    fn state(&self) -> PeripheralState {
        match self {
            Phase::Disconnected => PeripheralState::Disconnected,
            Phase::Advertising => PeripheralState::Advertising,
            Phase::Connecting { .. } => PeripheralState::Connecting,
            Phase::Connected { .. } => PeripheralState::Connected,
        }
    }
}

/// 会话独占的 GATT Server
#[derive(Debug)]
struct GattServer {
    handle: ServerHandle,
    /// 服务（含只读特征）是否已注册
    registered: bool,
}

/// 外设命令，供 [`PeripheralSession::run`] 使用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCommand {
    Enable,
    Disable,
    Send(Vec<u8>),
    SendText(String),
}

pub struct PeripheralSession<T: PeripheralTransport> {
    config: PeripheralConfig,
    transport: T,
    callback: Box<dyn PeripheralCallback>,
    phase: Phase,
    epoch: Epoch,
    server: Option<GattServer>,
    /// 只读特征的当前值，响应远端读取
    readonly_value: Vec<u8>,
    events: PeripheralEventSender,
    inbox: mpsc::UnboundedReceiver<Tagged<PeripheralTransportEvent>>,
}

impl<T: PeripheralTransport> PeripheralSession<T> {
    pub fn new(
        config: PeripheralConfig,
        mut transport: T,
        callback: impl PeripheralCallback + 'static,
    ) -> Self {
        let (events, inbox) = event_channel();
        transport.bind(events.clone());

        Self {
            config,
            transport,
            callback: Box::new(callback),
            phase: Phase::Disconnected,
            epoch: Epoch::default(),
            server: None,
            readonly_value: Vec::new(),
            events,
            inbox,
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.phase.state()
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn connected_device(&self) -> Option<&DeviceAddress> {
        match &self.phase {
            Phase::Connected { device } => Some(device),
            _ => None,
        }
    }

    /// 是否已注册 GATT 服务
    pub fn services_registered(&self) -> bool {
        self.server.as_ref().is_some_and(|s| s.registered)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// 传输事件投递句柄（与绑定给传输层的相同）
    pub fn event_sender(&self) -> PeripheralEventSender {
        self.events.clone()
    }

    /// 开始广播
    ///
    /// 射频不可用时通过回调报告一次 `RadioUnavailable`，不重试。
    /// 在 ADVERTISING/CONNECTING 时重新下发广播参数；CONNECTED 时不广播，
    /// 断开后会自动恢复。
    pub fn enable(&mut self) {
        if !self.transport.radio_available() {
            warn!("Bluetooth radio unavailable, cannot advertise");
            self.callback.on_error(&IotoothError::RadioUnavailable);
            return;
        }

        match &self.phase {
            Phase::Disconnected => {
                info!(
                    "Enabling peripheral, service_uuid={}",
                    self.config.service_uuid
                );
                self.start_advertising();
                self.set_phase(Phase::Advertising);
            }
            Phase::Advertising | Phase::Connecting { .. } => {
                debug!("Restarting advertising with current parameters");
                self.transport.stop_advertising();
                self.start_advertising();
            }
            Phase::Connected { device } => {
                debug!(
                    "Already connected to {}, advertising resumes on disconnect",
                    device
                );
            }
        }
    }

    /// 停止广播并释放全部服务端资源，任何状态下都可以调用
    pub fn disable(&mut self) {
        info!("Disabling peripheral");
        self.transport.stop_advertising();
        if let Some(server) = self.server.take() {
            self.transport.clear_services(server.handle);
            self.transport.close_gatt_server(server.handle);
        }
        self.readonly_value.clear();
        // 迟到的旧事件都会被丢弃
        self.epoch = self.epoch.next();
        self.phase = Phase::Disconnected;
        self.callback.on_state(PeripheralState::Disconnected, None);
    }

    /// 通过只读特征通知已连接设备
    pub fn send(&mut self, data: &[u8]) -> Result<Delivery> {
        let delivery = match (&self.phase, &self.server) {
            (Phase::Connected { device }, Some(server)) if server.registered => {
                self.readonly_value = data.to_vec();
                self.transport.notify_characteristic(
                    server.handle,
                    device,
                    self.config.readonly_uuid,
                    data,
                );
                debug!("Notified {} ({} bytes)", device, data.len());
                Delivery::Sent
            }
            (Phase::Connected { .. }, _) => Delivery::Dropped(DropReason::CharacteristicMissing),
            _ => Delivery::Dropped(DropReason::NotConnected),
        };

        if let Delivery::Dropped(reason) = &delivery {
            debug!("Send dropped: {}", reason);
        }
        self.config.delivery.resolve(delivery)
    }

    pub fn send_text(&mut self, text: &str) -> Result<Delivery> {
        self.send(text.as_bytes())
    }

    /// 处理一个传输事件，过期事件直接丢弃
    pub fn handle_event(&mut self, tagged: Tagged<PeripheralTransportEvent>) {
        if tagged.epoch != self.epoch {
            debug!(
                "Discarding stale event from epoch {:?} (current {:?}): {:?}",
                tagged.epoch, self.epoch, tagged.event
            );
            return;
        }

        match tagged.event {
            PeripheralTransportEvent::AdvertiseStarted => self.on_advertise_started(),
            PeripheralTransportEvent::AdvertiseFailed(failure) => {
                error!(
                    "Failed to start advertising: {} (code {})",
                    failure,
                    failure.code()
                );
                self.callback
                    .on_error(&IotoothError::AdvertisingFailed(failure));
                if self.phase == Phase::Advertising {
                    self.set_phase(Phase::Disconnected);
                }
            }
            PeripheralTransportEvent::ConnectionStateChanged { device, status } => {
                self.on_connection_state(device, status);
            }
            PeripheralTransportEvent::WriteRequest {
                request,
                device,
                characteristic,
                offset,
                value,
            } => {
                let Some(handle) = self.server.as_ref().map(|s| s.handle) else {
                    debug!("Write from {} without open server, ignored", device);
                    return;
                };
                if characteristic == self.config.writable_uuid {
                    debug!(
                        "Write request from {}: offset={}, len={}",
                        device,
                        offset,
                        value.len()
                    );
                    self.callback.on_message(offset, &value);
                    self.transport
                        .send_response(handle, request, GattStatus::Success, offset, &value);
                } else {
                    warn!(
                        "Write to non-writable characteristic {} from {}",
                        characteristic, device
                    );
                    self.transport.send_response(
                        handle,
                        request,
                        GattStatus::WriteNotPermitted,
                        offset,
                        &[],
                    );
                }
            }
            PeripheralTransportEvent::ReadRequest {
                request,
                device,
                characteristic,
                offset,
            } => self.on_read_request(request, &device, characteristic, offset),
        }
    }

    /// 等待并处理下一个传输事件
    pub async fn process_next(&mut self) -> bool {
        match self.inbox.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// 处理所有已排队的事件，不等待
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    pub fn execute(&mut self, command: PeripheralCommand) {
        let result = match command {
            PeripheralCommand::Enable => {
                self.enable();
                return;
            }
            PeripheralCommand::Disable => {
                self.disable();
                return;
            }
            PeripheralCommand::Send(data) => self.send(&data),
            PeripheralCommand::SendText(text) => self.send_text(&text),
        };
        if let Err(e) = result {
            self.callback.on_error(&e);
        }
    }

    /// 事件循环：命令与传输事件在同一任务上交替处理。
    /// 命令通道关闭后执行 `disable()` 并返回会话。
    pub async fn run(mut self, mut commands: mpsc::Receiver<PeripheralCommand>) -> Self {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => break,
                },
                Some(event) = self.inbox.recv() => self.handle_event(event),
            }
        }
        debug!("Command channel closed, shutting down peripheral");
        self.disable();
        self
    }

    fn start_advertising(&mut self) {
        let params = self.config.advertise_params();
        self.transport.start_advertising(self.epoch, &params);
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        let context = match &self.phase {
            Phase::Disconnected => None,
            Phase::Advertising => Some(self.config.service_uuid.to_string()),
            Phase::Connecting { device } | Phase::Connected { device } => {
                Some(device.to_string())
            }
        };
        info!("Peripheral state -> {}", self.phase.state());
        self.callback.on_state(self.phase.state(), context.as_deref());
    }

    /// 广播已确认：打开（必要时）GATT Server 并重建服务
    fn on_advertise_started(&mut self) {
        if self.phase == Phase::Disconnected {
            debug!("Advertise confirmation while disconnected, ignored");
            return;
        }

        if self.server.is_none() {
            match self.transport.open_gatt_server(self.epoch) {
                Ok(handle) => {
                    debug!("GATT server opened: {:?}", handle);
                    self.server = Some(GattServer {
                        handle,
                        registered: false,
                    });
                }
                Err(e) => {
                    error!("Failed to open GATT server: {}", e);
                    self.transport.stop_advertising();
                    self.callback.on_error(&e.into());
                    self.set_phase(Phase::Disconnected);
                    return;
                }
            }
        }

        let advertising = self.phase == Phase::Advertising;
        let Some(server) = self.server.as_mut() else {
            return;
        };
        // 已连接时保留现有服务，避免打断链路
        if server.registered && !advertising {
            return;
        }

        let service = self.config.service_definition();
        self.transport.clear_services(server.handle);
        self.transport.add_service(server.handle, &service);
        server.registered = true;
        info!(
            "GATT service registered: service={}, readonly={}, writable={}",
            self.config.service_uuid, self.config.readonly_uuid, self.config.writable_uuid
        );
    }

    fn on_connection_state(&mut self, device: DeviceAddress, status: LinkStatus) {
        match status {
            LinkStatus::Connecting => {
                if self.phase == Phase::Advertising {
                    self.set_phase(Phase::Connecting { device });
                }
            }
            LinkStatus::Connected => match &self.phase {
                Phase::Advertising | Phase::Connecting { .. } => {
                    info!("Central connected: {}", device);
                    self.set_phase(Phase::Connected { device });
                    // 只接受一个连接
                    self.transport.stop_advertising();
                }
                Phase::Connected { device: current } => {
                    if *current != device {
                        warn!(
                            "Ignoring second central {} while connected to {}",
                            device, current
                        );
                    }
                }
                Phase::Disconnected => {
                    debug!("Connection from {} while disabled, ignored", device);
                }
            },
            LinkStatus::Disconnecting => {
                debug!("Central {} disconnecting", device);
            }
            LinkStatus::Disconnected => match &self.phase {
                Phase::Connected { device: current } if *current == device => {
                    info!("Central disconnected: {}, resuming advertising", device);
                    self.set_phase(Phase::Disconnected);
                    self.start_advertising();
                    self.set_phase(Phase::Advertising);
                }
                Phase::Connecting { device: current } if *current == device => {
                    debug!("Connection attempt from {} abandoned", device);
                    self.set_phase(Phase::Advertising);
                }
                _ => {
                    debug!("Disconnect of untracked device {}, ignored", device);
                }
            },
        }
    }

    fn on_read_request(
        &mut self,
        request: RequestId,
        device: &DeviceAddress,
        characteristic: uuid::Uuid,
        offset: usize,
    ) {
        let Some(handle) = self.server.as_ref().map(|s| s.handle) else {
            return;
        };
        if characteristic != self.config.readonly_uuid {
            self.transport
                .send_response(handle, request, GattStatus::ReadNotPermitted, offset, &[]);
            return;
        }
        debug!("Read request from {}: offset={}", device, offset);
        match self.readonly_value.get(offset..) {
            Some(value) => {
                let value = value.to_vec();
                self.transport
                    .send_response(handle, request, GattStatus::Success, offset, &value);
            }
            None => {
                self.transport
                    .send_response(handle, request, GattStatus::InvalidOffset, offset, &[]);
            }
        }
    }
}
