//! 中心角色 - 扫描 + 多链路 GATT 客户端
//!
//! [`Central`] 拥有一个 [`ScanWindow`]（每次扫描替换）和一个
//! [`ConnectionRegistry`]（0..N 个 [`CentralLinkHandler`]，按地址索引）。
//! 只有 `Central` 会向注册表插入或移除条目。

pub mod link;
pub mod registry;
pub mod scan;

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::CentralConfig;
use crate::error::{IotoothError, Result};
use crate::event::{CentralCallback, CentralState, Delivery, DropReason, ScanCallback};
use crate::transport::{
    CentralEventSender, CentralTransport, CentralTransportEvent, DeviceAddress, DiscoveredDevice,
    ScanId, event_channel,
};

pub use link::{CentralLinkHandler, LinkPhase};
pub use registry::ConnectionRegistry;
pub use scan::ScanWindow;

/// 中心命令，供 [`Central::run`] 使用
pub enum CentralCommand {
    Scan {
        duration: Duration,
        callback: Box<dyn ScanCallback>,
    },
    StopScan,
    Connect(DiscoveredDevice),
    Disconnect(DeviceAddress),
    DisconnectAll,
    Send {
        address: DeviceAddress,
        data: Vec<u8>,
    },
    SendText {
        address: DeviceAddress,
        text: String,
    },
    Read(DeviceAddress),
}

pub struct Central<T: CentralTransport> {
    config: CentralConfig,
    transport: T,
    callback: Box<dyn CentralCallback>,
    scan: Option<ScanWindow>,
    next_scan: u64,
    registry: ConnectionRegistry,
    events: CentralEventSender,
    inbox: mpsc::UnboundedReceiver<CentralTransportEvent>,
}

impl<T: CentralTransport> Central<T> {
    pub fn new(
        config: CentralConfig,
        mut transport: T,
        callback: impl CentralCallback + 'static,
    ) -> Self {
        let (events, inbox) = event_channel();
        transport.bind(events.clone());

        Self {
            config,
            transport,
            callback: Box::new(callback),
            scan: None,
            next_scan: 0,
            registry: ConnectionRegistry::new(),
            events,
            inbox,
        }
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn event_sender(&self) -> CentralEventSender {
        self.events.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    pub fn active_scan(&self) -> Option<ScanId> {
        self.scan.as_ref().map(ScanWindow::id)
    }

    /// 使用配置的默认时长扫描
    pub fn scan(&mut self, callback: impl ScanCallback + 'static) {
        self.start_scan(self.config.scan_duration(), Box::new(callback));
    }

    /// 按配置的服务 UUID 扫描 `duration`，替换正在进行的扫描窗口
    pub fn scan_with_duration(
        &mut self,
        duration: Duration,
        callback: impl ScanCallback + 'static,
    ) {
        self.start_scan(duration, Box::new(callback));
    }

    fn start_scan(&mut self, duration: Duration, callback: Box<dyn ScanCallback>) {
        if !self.transport.radio_available() {
            warn!("Bluetooth radio unavailable, cannot scan");
            self.callback.on_error(&IotoothError::RadioUnavailable);
            return;
        }
        if let Some(previous) = self.scan.take() {
            previous.supersede();
        }
        self.next_scan += 1;
        let window = ScanWindow::start(
            &mut self.transport,
            ScanId(self.next_scan),
            self.config.service_uuid,
            duration,
            callback,
        );
        self.scan = Some(window);
    }

    /// 提前结束当前扫描窗口
    pub fn stop_scan(&mut self) {
        if let Some(window) = self.scan.take() {
            window.stop(&mut self.transport);
        }
    }

    /// 打开到设备的链路并登记
    ///
    /// 传输层返回空句柄时不登记、不发事件；`Strict` 策略下返回
    /// `LinkOpenFailed`。
    pub fn connect(&mut self, device: &DiscoveredDevice) -> Result<()> {
        let Some(handler) = CentralLinkHandler::open(&mut self.transport, device, &self.config)
        else {
            warn!("Failed to open link to {}", device.address);
            if self.config.delivery.is_strict() {
                return Err(IotoothError::LinkOpenFailed(device.address.clone()));
            }
            return Ok(());
        };

        self.registry.insert(&mut self.transport, handler);
        info!("Opened GATT link to {}", device.address);
        self.callback
            .on_state(CentralState::OpenedGatt, &device.address);
        Ok(())
    }

    /// 关闭并移除该地址的链路，不存在时什么都不做
    pub fn disconnect(&mut self, address: &DeviceAddress) {
        if self.registry.remove(&mut self.transport, address) {
            info!("Disconnected {}", address);
        } else {
            debug!("Disconnect of unknown address {}", address);
        }
    }

    /// 关闭全部链路，用于拥有者退出时的清理
    pub fn disconnect_all(&mut self) {
        let closed = self.registry.close_all(&mut self.transport);
        if !closed.is_empty() {
            info!("Disconnected {} link(s)", closed.len());
        }
    }

    pub fn send(&mut self, address: &DeviceAddress, data: &[u8]) -> Result<Delivery> {
        let delivery = match self.registry.get_mut(address) {
            Some(handler) => handler.send(&mut self.transport, data),
            None => Delivery::Dropped(DropReason::UnknownAddress(address.clone())),
        };
        if let Delivery::Dropped(reason) = &delivery {
            debug!("Send dropped: {}", reason);
        }
        self.config.delivery.resolve(delivery)
    }

    pub fn send_text(&mut self, address: &DeviceAddress, text: &str) -> Result<Delivery> {
        self.send(address, text.as_bytes())
    }

    /// 读取对端只读特征，结果通过 `on_message` 返回
    pub fn read(&mut self, address: &DeviceAddress) -> Result<Delivery> {
        let delivery = match self.registry.get_mut(address) {
            Some(handler) => handler.read(&mut self.transport),
            None => Delivery::Dropped(DropReason::UnknownAddress(address.clone())),
        };
        self.config.delivery.resolve(delivery)
    }

    pub fn handle_event(&mut self, event: CentralTransportEvent) {
        match event {
            CentralTransportEvent::ScanResult { scan, device } => match &self.scan {
                Some(window) if window.id() == scan => window.deliver(&device),
                _ => debug!("Discarding result from stale scan {:?}", scan),
            },
            CentralTransportEvent::ScanFailed { scan, failure } => match &self.scan {
                Some(window) if window.id() == scan => {
                    error!("Scan failed. code={} ({})", failure.code(), failure);
                    if self.config.delivery.is_strict() {
                        window.report_failure(failure);
                        self.callback.on_error(&IotoothError::ScanFailed(failure));
                    }
                }
                _ => debug!("Failure of stale scan {:?} ignored", scan),
            },
            CentralTransportEvent::Link {
                address,
                link,
                event,
            } => match self.registry.get_for_link(&address, link) {
                Some(handler) => {
                    handler.handle_event(&mut self.transport, event, self.callback.as_ref());
                }
                None => debug!(
                    "Discarding event for untracked link {:?} ({}): {:?}",
                    link, address, event
                ),
            },
        }
    }

    /// 截止时间已到则结束扫描窗口
    pub fn expire_scan(&mut self) -> bool {
        match &self.scan {
            Some(window) if window.is_expired(Instant::now()) => {
                self.stop_scan();
                true
            }
            _ => false,
        }
    }

    /// 等待下一个传输事件或扫描截止，处理后返回
    pub async fn process_next(&mut self) -> bool {
        let deadline = self.scan.as_ref().map(ScanWindow::deadline);
        tokio::select! {
            event = self.inbox.recv() => match event {
                Some(event) => {
                    self.handle_event(event);
                    true
                }
                None => false,
            },
            () = scan_deadline(deadline) => {
                self.expire_scan();
                true
            }
        }
    }

    /// 处理所有已排队的事件和已到期的扫描，不等待
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        if self.expire_scan() {
            handled += 1;
        }
        handled
    }

    pub fn execute(&mut self, command: CentralCommand) {
        let result = match command {
            CentralCommand::Scan { duration, callback } => {
                self.start_scan(duration, callback);
                Ok(())
            }
            CentralCommand::StopScan => {
                self.stop_scan();
                Ok(())
            }
            CentralCommand::Connect(device) => self.connect(&device),
            CentralCommand::Disconnect(address) => {
                self.disconnect(&address);
                Ok(())
            }
            CentralCommand::DisconnectAll => {
                self.disconnect_all();
                Ok(())
            }
            CentralCommand::Send { address, data } => self.send(&address, &data).map(|_| ()),
            CentralCommand::SendText { address, text } => {
                self.send_text(&address, &text).map(|_| ())
            }
            CentralCommand::Read(address) => self.read(&address).map(|_| ()),
        };
        if let Err(e) = result {
            self.callback.on_error(&e);
        }
    }

    /// 事件循环：命令、传输事件与扫描截止在同一任务上交替处理。
    /// 命令通道关闭后停止扫描、关闭全部链路并返回。
    pub async fn run(mut self, mut commands: mpsc::Receiver<CentralCommand>) -> Self {
        loop {
            let deadline = self.scan.as_ref().map(ScanWindow::deadline);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => break,
                },
                Some(event) = self.inbox.recv() => self.handle_event(event),
                () = scan_deadline(deadline) => {
                    self.expire_scan();
                }
            }
        }
        debug!("Command channel closed, shutting down central");
        self.stop_scan();
        self.disconnect_all();
        self
    }
}

async fn scan_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
