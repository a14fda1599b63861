//! BLE Client - 基于 btleplug 的中心绑定
//!
//! 扫描结果、链路状态和特征读写结果都以 [`CentralTransportEvent`] 投递给
//! [`Central`](crate::Central)。每条链路的后台任务在 `close_link` 时中止。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use btleplug::api::{
    Central as _, CentralEvent as AdapterEvent, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral, PeripheralId};
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    CentralEventSender, CentralTransport, CentralTransportEvent, DeviceAddress, DiscoveredDevice,
    LinkEvent, LinkId, LinkStatus, ScanFailure, ScanId,
};

/// 扫描中见过的设备，`open_link` 只能打开这里的地址
type KnownPeripherals = Arc<Mutex<HashMap<DeviceAddress, PlatformPeripheral>>>;
/// 平台 ID 到链路的索引，用于把断开事件路由到链路
type LinkIndex = Arc<Mutex<HashMap<PeripheralId, (DeviceAddress, LinkId)>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveScan {
    id: ScanId,
    task: JoinHandle<()>,
}

struct OpenLink {
    address: DeviceAddress,
    peripheral: PlatformPeripheral,
    /// 已开启通知的特征，关闭链路时取消订阅
    subscribed: Option<Uuid>,
    tasks: Vec<JoinHandle<()>>,
}

impl OpenLink {
    fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(tokio::spawn(future));
    }
}

/// btleplug 中心传输
pub struct BtleplugCentral {
    adapter: Adapter,
    events: Option<CentralEventSender>,
    known: KnownPeripherals,
    index: LinkIndex,
    scan: Option<ActiveScan>,
    links: HashMap<LinkId, OpenLink>,
    next_link: u64,
    watcher: Option<JoinHandle<()>>,
}

impl BtleplugCentral {
    /// 打开第一个可用的适配器
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        if let Ok(info) = adapter.adapter_info().await {
            debug!("Using adapter {}", info);
        }

        Ok(Self {
            adapter,
            events: None,
            known: Arc::default(),
            index: Arc::default(),
            scan: None,
            links: HashMap::new(),
            next_link: 0,
            watcher: None,
        })
    }

    fn sender(&self) -> Option<CentralEventSender> {
        if self.events.is_none() {
            warn!("Central transport used before bind, event dropped");
        }
        self.events.clone()
    }

    /// 在链路上派发一个后台操作
    fn spawn_on_link<F, Fut>(&mut self, link: LinkId, op: F)
    where
        F: FnOnce(PlatformPeripheral, LinkSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(events) = self.sender() else { return };
        let Some(open) = self.links.get_mut(&link) else {
            debug!("Operation on closed link {:?} ignored", link);
            return;
        };
        let sender = LinkSender {
            events,
            address: open.address.clone(),
            link,
        };
        let future = op(open.peripheral.clone(), sender);
        open.spawn(future);
    }
}

/// 带链路身份的事件发送端
#[derive(Clone)]
struct LinkSender {
    events: CentralEventSender,
    address: DeviceAddress,
    link: LinkId,
}

impl LinkSender {
    fn send(&self, event: LinkEvent) {
        self.events.send(CentralTransportEvent::Link {
            address: self.address.clone(),
            link: self.link,
            event,
        });
    }
}

fn find_characteristic(
    peripheral: &PlatformPeripheral,
    uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(TransportError::CharacteristicNotFound(uuid))
}

/// 同一地址上是否还有其他打开的链路
fn address_in_use<'a>(
    mut open: impl Iterator<Item = &'a DeviceAddress>,
    address: &DeviceAddress,
) -> bool {
    open.any(|a| a == address)
}

fn scan_failure(e: &btleplug::Error) -> ScanFailure {
    match e {
        btleplug::Error::PermissionDenied => ScanFailure::RegistrationFailed,
        btleplug::Error::NotSupported(_) => ScanFailure::FeatureUnsupported,
        _ => ScanFailure::InternalError,
    }
}

/// 扫描任务：转发发现/更新事件，不去重
async fn run_scan(
    adapter: Adapter,
    scan: ScanId,
    filter: Uuid,
    events: CentralEventSender,
    known: KnownPeripherals,
) -> Result<(), btleplug::Error> {
    let mut stream = adapter.events().await?;
    adapter
        .start_scan(ScanFilter {
            services: vec![filter],
        })
        .await?;

    while let Some(event) = stream.next().await {
        let id = match event {
            AdapterEvent::DeviceDiscovered(id)
            | AdapterEvent::DeviceUpdated(id)
            | AdapterEvent::ServicesAdvertisement { id, .. } => id,
            _ => continue,
        };
        let peripheral = adapter.peripheral(&id).await?;
        let Some(props) = peripheral.properties().await? else {
            continue;
        };
        // 部分后端不按 ScanFilter 过滤，这里再按广播的服务列表筛一次
        if !props.services.is_empty() && !props.services.contains(&filter) {
            continue;
        }

        let address = DeviceAddress::new(props.address.to_string());
        trace!("Scan result {} rssi={:?}", address, props.rssi);
        lock(&known).insert(address.clone(), peripheral);
        events.send(CentralTransportEvent::ScanResult {
            scan,
            device: DiscoveredDevice {
                address,
                name: props.local_name,
                rssi: props.rssi,
                services: props.services,
            },
        });
    }
    Ok(())
}

/// 监视适配器上的断开事件
async fn watch_disconnects(adapter: Adapter, events: CentralEventSender, index: LinkIndex) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to watch adapter events: {}", e);
            return;
        }
    };
    while let Some(event) = stream.next().await {
        if let AdapterEvent::DeviceDisconnected(id) = event {
            let entry = lock(&index).get(&id).cloned();
            if let Some((address, link)) = entry {
                debug!("Link {:?} to {} disconnected", link, address);
                events.send(CentralTransportEvent::Link {
                    address,
                    link,
                    event: LinkEvent::StateChanged(LinkStatus::Disconnected),
                });
            }
        }
    }
}

impl CentralTransport for BtleplugCentral {
    fn bind(&mut self, events: CentralEventSender) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.watcher = Some(tokio::spawn(watch_disconnects(
            self.adapter.clone(),
            events.clone(),
            self.index.clone(),
        )));
        self.events = Some(events);
    }

    fn radio_available(&mut self) -> bool {
        true
    }

    fn start_scan(&mut self, scan: ScanId, filter: Uuid) {
        let Some(events) = self.sender() else { return };
        if let Some(previous) = self.scan.take() {
            debug!("Scan {:?} replaced by {:?}", previous.id, scan);
            previous.task.abort();
        }

        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = run_scan(adapter, scan, filter, events.clone(), known).await {
                error!("Scan {:?} failed: {}", scan, e);
                events.send(CentralTransportEvent::ScanFailed {
                    scan,
                    failure: scan_failure(&e),
                });
            }
        });
        self.scan = Some(ActiveScan { id: scan, task });
    }

    fn stop_scan(&mut self, scan: ScanId) {
        let Some(active) = self.scan.take_if(|s| s.id == scan) else {
            return;
        };
        active.task.abort();
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn open_link(&mut self, address: &DeviceAddress) -> Option<LinkId> {
        let events = self.sender()?;
        let Some(peripheral) = lock(&self.known).get(address).cloned() else {
            warn!("Device {} was not seen in a scan", address);
            return None;
        };

        self.next_link += 1;
        let link = LinkId(self.next_link);
        lock(&self.index).insert(peripheral.id(), (address.clone(), link));

        let sender = LinkSender {
            events,
            address: address.clone(),
            link,
        };
        let mut open = OpenLink {
            address: address.clone(),
            peripheral: peripheral.clone(),
            subscribed: None,
            tasks: Vec::new(),
        };
        open.spawn(async move {
            sender.send(LinkEvent::StateChanged(LinkStatus::Connecting));
            info!("Connecting to {}", sender.address);
            match peripheral.connect().await {
                Ok(()) => sender.send(LinkEvent::StateChanged(LinkStatus::Connected)),
                Err(e) => {
                    warn!("Connection to {} failed: {}", sender.address, e);
                    sender.send(LinkEvent::StateChanged(LinkStatus::Disconnected));
                }
            }
        });
        self.links.insert(link, open);
        Some(link)
    }

    fn close_link(&mut self, link: LinkId) {
        let Some(open) = self.links.remove(&link) else {
            return;
        };
        for task in &open.tasks {
            task.abort();
        }
        lock(&self.index).retain(|_, (_, l)| *l != link);

        // 新链路与旧链路共用同一个平台外设
        if address_in_use(self.links.values().map(|o| &o.address), &open.address) {
            debug!("Link {:?} replaced, keeping connection to {}", link, open.address);
            return;
        }

        let peripheral = open.peripheral;
        let subscribed = open.subscribed;
        tokio::spawn(async move {
            if let Some(characteristic) = subscribed {
                let result = match find_characteristic(&peripheral, characteristic) {
                    Ok(c) => peripheral.unsubscribe(&c).await.map_err(TransportError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    debug!("Unsubscribe on link {:?} failed: {}", link, e);
                }
            }
            match peripheral.disconnect().await {
                Ok(()) => debug!("Link {:?} closed", link),
                Err(e) => debug!("Disconnect of link {:?} failed: {}", link, e),
            }
        });
    }

    fn discover_services(&mut self, link: LinkId, service: Uuid) {
        self.spawn_on_link(link, move |peripheral, sender| async move {
            debug!("Discovering services on {}", sender.address);
            match peripheral.discover_services().await {
                Ok(()) => {
                    let characteristics = peripheral
                        .characteristics()
                        .into_iter()
                        .filter(|c| c.service_uuid == service)
                        .map(|c| c.uuid)
                        .collect();
                    sender.send(LinkEvent::ServicesDiscovered { characteristics });
                }
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", sender.address, e);
                    sender.send(LinkEvent::DiscoveryFailed);
                }
            }
        });
    }

    fn read_characteristic(&mut self, link: LinkId, characteristic: Uuid) {
        self.spawn_on_link(link, move |peripheral, sender| async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Ok(c) => peripheral.read(&c).await.map_err(TransportError::from),
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => sender.send(LinkEvent::ReadCompleted {
                    characteristic,
                    value,
                }),
                Err(e) => warn!("Read of {} on {} failed: {}", characteristic, sender.address, e),
            }
        });
    }

    fn write_characteristic(&mut self, link: LinkId, characteristic: Uuid, value: &[u8]) {
        let value = value.to_vec();
        self.spawn_on_link(link, move |peripheral, sender| async move {
            let result = match find_characteristic(&peripheral, characteristic) {
                Ok(c) => peripheral
                    .write(&c, &value, WriteType::WithResponse)
                    .await
                    .map_err(TransportError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!("Write to {} on {} failed: {}", characteristic, sender.address, e);
            }
            sender.send(LinkEvent::WriteCompleted {
                characteristic,
                ok: result.is_ok(),
            });
        });
    }

    fn set_notify(&mut self, link: LinkId, characteristic: Uuid, enabled: bool) {
        if let Some(open) = self.links.get_mut(&link) {
            open.subscribed = enabled.then_some(characteristic);
        }
        self.spawn_on_link(link, move |peripheral, sender| async move {
            let c = match find_characteristic(&peripheral, characteristic) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Cannot change notifications on {}: {}", sender.address, e);
                    return;
                }
            };
            if !enabled {
                if let Err(e) = peripheral.unsubscribe(&c).await {
                    debug!("Unsubscribe on {} failed: {}", sender.address, e);
                }
                return;
            }

            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Notification stream on {} failed: {}", sender.address, e);
                    return;
                }
            };
            if let Err(e) = peripheral.subscribe(&c).await {
                warn!("Subscribe on {} failed: {}", sender.address, e);
                return;
            }
            debug!("Subscribed to {} on {}", characteristic, sender.address);
            while let Some(n) = notifications.next().await {
                if n.uuid == characteristic {
                    sender.send(LinkEvent::Notification {
                        characteristic,
                        value: n.value,
                    });
                }
            }
        });
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(scan) = self.scan.take() {
            scan.task.abort();
        }
        for open in self.links.values() {
            for task in &open.tasks {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaced_link_keeps_connection() {
        let a = DeviceAddress::new("AA:AA:AA:AA:AA:AA");
        let b = DeviceAddress::new("BB:BB:BB:BB:BB:BB");

        // 重连后新链路仍在 links 中
        assert!(address_in_use([&b, &a].into_iter(), &a));
        assert!(!address_in_use([&b].into_iter(), &a));
        assert!(!address_in_use(std::iter::empty(), &a));
    }
}
