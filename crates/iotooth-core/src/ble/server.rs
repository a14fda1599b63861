//! GATT Server - 基于 BlueZ 的外设绑定
//!
//! 广播、GATT 应用注册与连接监视都在 tokio 任务上完成，结果以
//! [`PeripheralTransportEvent`] 投递给 [`PeripheralSession`](crate::PeripheralSession)。
//!
//! 远端的读写请求不在这里应答：请求被转成事件送给会话，BlueZ 的回调
//! 挂起等待会话通过 `send_response` 给出状态，超时则回 `Failed`。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bluer::adv::{Advertisement, AdvertisementHandle, Feature};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, ErrorKind};
use futures_util::stream::{SelectAll, Stream, StreamExt};
use futures_util::FutureExt;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    AdvertiseFailure, AdvertiseParams, CharacteristicDefinition, DeviceAddress, Epoch, GattStatus,
    LinkStatus, PeripheralEventSender, PeripheralTransport, PeripheralTransportEvent, RequestId,
    ServerHandle, ServiceDefinition,
};

/// BlueZ 回调等待会话应答的上限
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

type Response = (GattStatus, Vec<u8>);
type DeviceEvents = Pin<Box<dyn Stream<Item = (Address, DeviceEvent)> + Send>>;

/// 跨任务共享的句柄与挂起请求
#[derive(Default)]
struct Shared {
    /// 每次开始/停止广播递增，迟到的广播句柄据此丢弃
    adv_generation: u64,
    advertisement: Option<AdvertisementHandle>,
    /// 每次清空服务递增
    app_generation: u64,
    application: Option<ApplicationHandle>,
    pending: HashMap<RequestId, oneshot::Sender<Response>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 当前打开的 GATT Server
struct OpenServer {
    handle: ServerHandle,
    epoch: Epoch,
    watcher: JoinHandle<()>,
    notify_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    notify_pump: Option<JoinHandle<()>>,
}

impl OpenServer {
    fn stop_notify_pump(&mut self) {
        self.notify_tx = None;
        if let Some(pump) = self.notify_pump.take() {
            pump.abort();
        }
    }
}

/// BlueZ 外设传输
pub struct BluerPeripheral {
    _session: bluer::Session,
    adapter: Adapter,
    powered: bool,
    events: Option<PeripheralEventSender>,
    shared: Arc<Mutex<Shared>>,
    next_request: Arc<AtomicU64>,
    next_server: u64,
    server: Option<OpenServer>,
}

impl BluerPeripheral {
    /// 连接 BlueZ 并打开默认适配器
    pub async fn new() -> Result<Self, TransportError> {
        debug!("Initializing BLE session...");
        let session = bluer::Session::new().await?;

        debug!("Getting default adapter...");
        let adapter = session.default_adapter().await?;

        debug!("Powering on adapter: {}", adapter.name());
        let powered = match adapter.set_powered(true).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to power on adapter {}: {}", adapter.name(), e);
                adapter.is_powered().await.unwrap_or(false)
            }
        };

        Ok(Self {
            _session: session,
            adapter,
            powered,
            events: None,
            shared: Arc::new(Mutex::new(Shared::default())),
            next_request: Arc::new(AtomicU64::new(1)),
            next_server: 0,
            server: None,
        })
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    fn sender(&self) -> Option<PeripheralEventSender> {
        if self.events.is_none() {
            warn!("Peripheral transport used before bind, event dropped");
        }
        self.events.clone()
    }

    fn server_mut(&mut self, handle: ServerHandle) -> Option<&mut OpenServer> {
        self.server.as_mut().filter(|s| s.handle == handle)
    }

    fn build_characteristic(
        &self,
        definition: &CharacteristicDefinition,
        epoch: Epoch,
        events: &PeripheralEventSender,
        notifier_tx: &mpsc::UnboundedSender<CharacteristicNotifier>,
    ) -> Characteristic {
        let uuid = definition.uuid;
        let props = definition.properties;

        let read = props.read.then(|| {
            let events = events.clone();
            let shared = self.shared.clone();
            let next = self.next_request.clone();
            CharacteristicRead {
                read: true,
                fun: Box::new(move |req| {
                    let request = RequestId(next.fetch_add(1, Ordering::Relaxed));
                    let rx = register(&shared, request);
                    events.send_tagged(
                        epoch,
                        PeripheralTransportEvent::ReadRequest {
                            request,
                            device: DeviceAddress::new(req.device_address.to_string()),
                            characteristic: uuid,
                            offset: usize::from(req.offset),
                        },
                    );
                    let shared = shared.clone();
                    async move {
                        await_response(&shared, request, rx)
                            .await
                            .and_then(|(status, value)| match status {
                                GattStatus::Success => Ok(value),
                                other => Err(req_error(other)),
                            })
                    }
                    .boxed()
                }),
                ..Default::default()
            }
        });

        let write = (props.write || props.write_without_response).then(|| {
            let events = events.clone();
            let shared = self.shared.clone();
            let next = self.next_request.clone();
            CharacteristicWrite {
                write: props.write,
                write_without_response: props.write_without_response,
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                    let request = RequestId(next.fetch_add(1, Ordering::Relaxed));
                    let rx = register(&shared, request);
                    events.send_tagged(
                        epoch,
                        PeripheralTransportEvent::WriteRequest {
                            request,
                            device: DeviceAddress::new(req.device_address.to_string()),
                            characteristic: uuid,
                            offset: usize::from(req.offset),
                            value,
                        },
                    );
                    let shared = shared.clone();
                    async move {
                        await_response(&shared, request, rx)
                            .await
                            .and_then(|(status, _)| match status {
                                GattStatus::Success => Ok(()),
                                other => Err(req_error(other)),
                            })
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

        // 只有只读特征的订阅会被通知泵使用
        let notify = props.notify.then(|| {
            let notifier_tx = (props.read && !props.write).then(|| notifier_tx.clone());
            CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let notifier_tx = notifier_tx.clone();
                    async move {
                        debug!("Notification session started for {}", uuid);
                        if let Some(tx) = notifier_tx {
                            let _ = tx.send(notifier);
                        }
                    }
                    .boxed()
                })),
                ..Default::default()
            }
        });

        Characteristic {
            uuid,
            read,
            write,
            notify,
            ..Default::default()
        }
    }
}

/// 登记一个等待应答的请求
fn register(shared: &Mutex<Shared>, request: RequestId) -> oneshot::Receiver<Response> {
    let (tx, rx) = oneshot::channel();
    lock(shared).pending.insert(request, tx);
    rx
}

async fn await_response(
    shared: &Mutex<Shared>,
    request: RequestId,
    rx: oneshot::Receiver<Response>,
) -> Result<Response, ReqError> {
    match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => {
            debug!("Request {:?} abandoned", request);
            Err(ReqError::Failed)
        }
        Err(_) => {
            warn!("No response to request {:?} within {:?}", request, RESPONSE_TIMEOUT);
            lock(shared).pending.remove(&request);
            Err(ReqError::Failed)
        }
    }
}

fn req_error(status: GattStatus) -> ReqError {
    match status {
        GattStatus::ReadNotPermitted | GattStatus::WriteNotPermitted => ReqError::NotPermitted,
        GattStatus::InvalidOffset => ReqError::InvalidOffset,
        GattStatus::Success | GattStatus::Failure => ReqError::Failed,
    }
}

fn advertise_failure(e: &bluer::Error) -> AdvertiseFailure {
    match e.kind {
        ErrorKind::AlreadyExists | ErrorKind::InProgress => AdvertiseFailure::AlreadyStarted,
        ErrorKind::InvalidLength => AdvertiseFailure::DataTooLarge,
        ErrorKind::NotSupported => AdvertiseFailure::FeatureUnsupported,
        ErrorKind::NotPermitted => AdvertiseFailure::TooManyAdvertisers,
        _ => AdvertiseFailure::InternalError,
    }
}

/// 把通知值送给最近一次订阅的中心设备
async fn notify_pump(
    mut notifiers: mpsc::UnboundedReceiver<CharacteristicNotifier>,
    mut values: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut current: Option<CharacteristicNotifier> = None;
    loop {
        tokio::select! {
            Some(notifier) = notifiers.recv() => current = Some(notifier),
            value = values.recv() => {
                let Some(value) = value else { break };
                match current.as_mut() {
                    Some(notifier) if !notifier.is_stopped() => {
                        if let Err(e) = notifier.notify(value).await {
                            warn!("Notification failed: {}", e);
                            current = None;
                        }
                    }
                    _ => trace!("No subscriber, notification of {} bytes skipped", value.len()),
                }
            }
        }
    }
}

/// 监视所有设备的 Connected 属性，转成连接状态事件
async fn watch_connections(
    adapter: Adapter,
    events: PeripheralEventSender,
    epoch: Epoch,
) -> Result<(), TransportError> {
    let adapter_events = adapter.events().await?;
    futures_util::pin_mut!(adapter_events);
    let mut device_events: SelectAll<DeviceEvents> = SelectAll::new();
    let mut watched = HashSet::new();

    for address in adapter.device_addresses().await? {
        watch_device(&adapter, address, &mut watched, &mut device_events).await?;
    }

    loop {
        tokio::select! {
            Some(event) = adapter_events.next() => {
                if let AdapterEvent::DeviceAdded(address) = event {
                    watch_device(&adapter, address, &mut watched, &mut device_events).await?;
                }
            }
            Some((address, event)) = device_events.next() => {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
                    let status = if connected {
                        LinkStatus::Connected
                    } else {
                        LinkStatus::Disconnected
                    };
                    debug!("Device {} connection changed: {:?}", address, status);
                    events.send_tagged(
                        epoch,
                        PeripheralTransportEvent::ConnectionStateChanged {
                            device: DeviceAddress::new(address.to_string()),
                            status,
                        },
                    );
                }
            }
            else => break,
        }
    }
    Ok(())
}

async fn watch_device(
    adapter: &Adapter,
    address: Address,
    watched: &mut HashSet<Address>,
    streams: &mut SelectAll<DeviceEvents>,
) -> Result<(), TransportError> {
    if !watched.insert(address) {
        return Ok(());
    }
    let device = adapter.device(address)?;
    let stream = device.events().await?.map(move |e| (address, e));
    streams.push(Box::pin(stream));
    Ok(())
}

impl PeripheralTransport for BluerPeripheral {
    fn bind(&mut self, events: PeripheralEventSender) {
        self.events = Some(events);
    }

    fn radio_available(&mut self) -> bool {
        self.powered
    }

    fn start_advertising(&mut self, epoch: Epoch, params: &AdvertiseParams) {
        let Some(events) = self.sender() else { return };

        let generation = {
            let mut shared = lock(&self.shared);
            shared.adv_generation += 1;
            shared.advertisement = None;
            shared.adv_generation
        };

        let mut system_includes = BTreeSet::new();
        if params.include_tx_power {
            system_includes.insert(Feature::TxPower);
        }
        let adv = Advertisement {
            advertisement_type: if params.connectable {
                bluer::adv::Type::Peripheral
            } else {
                bluer::adv::Type::Broadcast
            },
            service_uuids: BTreeSet::from([params.service_uuid]),
            local_name: params.local_name.clone(),
            discoverable: Some(true),
            system_includes,
            ..Default::default()
        };

        debug!(
            "Starting BLE advertisement: service_uuid={}, local_name={:?}",
            params.service_uuid, params.local_name
        );
        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match adapter.advertise(adv).await {
                Ok(handle) => {
                    let current = {
                        let mut shared = lock(&shared);
                        let current = shared.adv_generation == generation;
                        if current {
                            shared.advertisement = Some(handle);
                        }
                        current
                    };
                    if current {
                        debug!("BLE advertisement started successfully");
                        events.send_tagged(epoch, PeripheralTransportEvent::AdvertiseStarted);
                    } else {
                        debug!("Advertisement superseded before it started, dropped");
                    }
                }
                Err(e) => {
                    error!("Failed to start advertisement: {}", e);
                    events.send_tagged(
                        epoch,
                        PeripheralTransportEvent::AdvertiseFailed(advertise_failure(&e)),
                    );
                }
            }
        });
    }

    fn stop_advertising(&mut self) {
        let handle = {
            let mut shared = lock(&self.shared);
            shared.adv_generation += 1;
            shared.advertisement.take()
        };
        if handle.is_some() {
            debug!("BLE advertisement stopped");
        }
    }

    fn open_gatt_server(&mut self, epoch: Epoch) -> Result<ServerHandle, TransportError> {
        if !self.powered {
            return Err(TransportError::PoweredOff);
        }
        let events = self.sender().ok_or_else(|| {
            TransportError::Other("transport is not bound to a session".to_string())
        })?;
        if let Some(previous) = self.server.as_ref().map(|s| s.handle) {
            self.close_gatt_server(previous);
        }

        self.next_server += 1;
        let handle = ServerHandle(self.next_server);
        let adapter = self.adapter.clone();
        let watcher = tokio::spawn(async move {
            if let Err(e) = watch_connections(adapter, events, epoch).await {
                error!("Connection watcher stopped: {}", e);
            }
        });

        info!("GATT server {:?} opened on {}", handle, self.adapter.name());
        self.server = Some(OpenServer {
            handle,
            epoch,
            watcher,
            notify_tx: None,
            notify_pump: None,
        });
        Ok(handle)
    }

    fn clear_services(&mut self, server: ServerHandle) {
        let Some(open) = self.server_mut(server) else {
            return;
        };
        open.stop_notify_pump();
        let application = {
            let mut shared = lock(&self.shared);
            shared.app_generation += 1;
            shared.application.take()
        };
        if application.is_some() {
            debug!("GATT application unregistered");
        }
    }

    fn add_service(&mut self, server: ServerHandle, service: &ServiceDefinition) {
        let Some(events) = self.sender() else { return };
        let Some(epoch) = self.server_mut(server).map(|s| s.epoch) else {
            warn!("add_service on closed server {:?}", server);
            return;
        };

        let (notifier_tx, notifier_rx) = mpsc::unbounded_channel();
        let (value_tx, value_rx) = mpsc::unbounded_channel();
        let characteristics = service
            .characteristics
            .iter()
            .map(|c| self.build_characteristic(c, epoch, &events, &notifier_tx))
            .collect();
        let app = Application {
            services: vec![Service {
                uuid: service.uuid,
                primary: service.primary,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        if let Some(open) = self.server_mut(server) {
            open.stop_notify_pump();
            open.notify_tx = Some(value_tx);
            open.notify_pump = Some(tokio::spawn(notify_pump(notifier_rx, value_rx)));
        }

        let generation = lock(&self.shared).app_generation;
        let adapter = self.adapter.clone();
        let shared = self.shared.clone();
        let service_uuid = service.uuid;
        debug!("Registering GATT application with service_uuid={}", service_uuid);
        tokio::spawn(async move {
            match adapter.serve_gatt_application(app).await {
                Ok(handle) => {
                    let mut shared = lock(&shared);
                    if shared.app_generation == generation {
                        shared.application = Some(handle);
                        debug!("GATT application registered successfully");
                    }
                }
                Err(e) => error!("Failed to register service {}: {}", service_uuid, e),
            }
        });
    }

    fn close_gatt_server(&mut self, server: ServerHandle) {
        let Some(mut open) = self.server.take_if(|s| s.handle == server) else {
            return;
        };
        open.stop_notify_pump();
        open.watcher.abort();
        let pending = {
            let mut shared = lock(&self.shared);
            shared.app_generation += 1;
            shared.application = None;
            std::mem::take(&mut shared.pending)
        };
        // 丢弃发送端，挂起的 BlueZ 回调随之返回 Failed
        drop(pending);
        info!("GATT server {:?} closed", server);
    }

    fn notify_characteristic(
        &mut self,
        server: ServerHandle,
        device: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
    ) {
        let Some(open) = self.server_mut(server) else {
            return;
        };
        match &open.notify_tx {
            Some(tx) => {
                trace!("Notify {} on {}: {} bytes", device, characteristic, value.len());
                let _ = tx.send(value.to_vec());
            }
            None => debug!("No service registered, notification dropped"),
        }
    }

    fn send_response(
        &mut self,
        server: ServerHandle,
        request: RequestId,
        status: GattStatus,
        _offset: usize,
        value: &[u8],
    ) {
        if self.server_mut(server).is_none() {
            return;
        }
        let Some(tx) = lock(&self.shared).pending.remove(&request) else {
            debug!("Response to unknown or expired request {:?}", request);
            return;
        };
        let _ = tx.send((status, value.to_vec()));
    }
}

impl Drop for BluerPeripheral {
    fn drop(&mut self) {
        if let Some(mut open) = self.server.take() {
            open.stop_notify_pump();
            open.watcher.abort();
        }
    }
}
