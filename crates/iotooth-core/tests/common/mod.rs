//! 记录调用的传输桩

#![allow(dead_code)]

use iotooth_core::error::TransportError;
use iotooth_core::transport::{
    AdvertiseParams, CentralEventSender, CentralTransport, DeviceAddress, Epoch, GattStatus,
    LinkId, PeripheralEventSender, PeripheralTransport, RequestId, ScanId, ServerHandle,
    ServiceDefinition,
};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralCall {
    StartAdvertising(Epoch),
    StopAdvertising,
    OpenServer(Epoch),
    ClearServices,
    AddService(ServiceDefinition),
    CloseServer,
    Notify {
        device: DeviceAddress,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Response {
        request: RequestId,
        status: GattStatus,
        offset: usize,
        value: Vec<u8>,
    },
}

#[derive(Default)]
pub struct RecordingPeripheral {
    pub radio_off: bool,
    pub fail_open: bool,
    pub calls: Vec<PeripheralCall>,
    pub advertising: bool,
    pub services: Vec<ServiceDefinition>,
    pub server: Option<ServerHandle>,
    pub next_server: u64,
}

impl RecordingPeripheral {
    pub fn responses(&self) -> Vec<(GattStatus, Vec<u8>)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::Response { status, value, .. } => Some((*status, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, PeripheralCall::Notify { .. }))
            .count()
    }

    pub fn count(&self, call: &PeripheralCall) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }
}

impl PeripheralTransport for RecordingPeripheral {
    fn bind(&mut self, _events: PeripheralEventSender) {}

    fn radio_available(&mut self) -> bool {
        !self.radio_off
    }

    fn start_advertising(&mut self, epoch: Epoch, _params: &AdvertiseParams) {
        self.advertising = true;
        self.calls.push(PeripheralCall::StartAdvertising(epoch));
    }

    fn stop_advertising(&mut self) {
        self.advertising = false;
        self.calls.push(PeripheralCall::StopAdvertising);
    }

    fn open_gatt_server(&mut self, epoch: Epoch) -> Result<ServerHandle, TransportError> {
        self.calls.push(PeripheralCall::OpenServer(epoch));
        if self.fail_open {
            return Err(TransportError::PoweredOff);
        }
        self.next_server += 1;
        let handle = ServerHandle(self.next_server);
        self.server = Some(handle);
        Ok(handle)
    }

    fn clear_services(&mut self, _server: ServerHandle) {
        self.services.clear();
        self.calls.push(PeripheralCall::ClearServices);
    }

    fn add_service(&mut self, _server: ServerHandle, service: &ServiceDefinition) {
        self.services.push(service.clone());
        self.calls.push(PeripheralCall::AddService(service.clone()));
    }

    fn close_gatt_server(&mut self, _server: ServerHandle) {
        self.server = None;
        self.calls.push(PeripheralCall::CloseServer);
    }

    fn notify_characteristic(
        &mut self,
        _server: ServerHandle,
        device: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
    ) {
        self.calls.push(PeripheralCall::Notify {
            device: device.clone(),
            characteristic,
            value: value.to_vec(),
        });
    }

    fn send_response(
        &mut self,
        _server: ServerHandle,
        request: RequestId,
        status: GattStatus,
        offset: usize,
        value: &[u8],
    ) {
        self.calls.push(PeripheralCall::Response {
            request,
            status,
            offset,
            value: value.to_vec(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CentralCall {
    StartScan(ScanId, Uuid),
    StopScan(ScanId),
    OpenLink(DeviceAddress),
    CloseLink(LinkId),
    Discover(LinkId, Uuid),
    Read(LinkId, Uuid),
    Write(LinkId, Uuid, Vec<u8>),
    SetNotify(LinkId, Uuid, bool),
}

#[derive(Default)]
pub struct RecordingCentral {
    pub radio_off: bool,
    /// 模拟平台返回空链路句柄
    pub refuse_links: bool,
    pub calls: Vec<CentralCall>,
    pub next_link: u64,
}

impl RecordingCentral {
    pub fn writes(&self) -> Vec<(LinkId, Vec<u8>)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CentralCall::Write(link, _, value) => Some((*link, value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<LinkId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CentralCall::CloseLink(link) => Some(*link),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<ScanId> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                CentralCall::StopScan(scan) => Some(*scan),
                _ => None,
            })
            .collect()
    }
}

impl CentralTransport for RecordingCentral {
    fn bind(&mut self, _events: CentralEventSender) {}

    fn radio_available(&mut self) -> bool {
        !self.radio_off
    }

    fn start_scan(&mut self, scan: ScanId, filter: Uuid) {
        self.calls.push(CentralCall::StartScan(scan, filter));
    }

    fn stop_scan(&mut self, scan: ScanId) {
        self.calls.push(CentralCall::StopScan(scan));
    }

    fn open_link(&mut self, address: &DeviceAddress) -> Option<LinkId> {
        self.calls.push(CentralCall::OpenLink(address.clone()));
        if self.refuse_links {
            return None;
        }
        self.next_link += 1;
        Some(LinkId(self.next_link))
    }

    fn close_link(&mut self, link: LinkId) {
        self.calls.push(CentralCall::CloseLink(link));
    }

    fn discover_services(&mut self, link: LinkId, service: Uuid) {
        self.calls.push(CentralCall::Discover(link, service));
    }

    fn read_characteristic(&mut self, link: LinkId, characteristic: Uuid) {
        self.calls.push(CentralCall::Read(link, characteristic));
    }

    fn write_characteristic(&mut self, link: LinkId, characteristic: Uuid, value: &[u8]) {
        self.calls
            .push(CentralCall::Write(link, characteristic, value.to_vec()));
    }

    fn set_notify(&mut self, link: LinkId, characteristic: Uuid, enabled: bool) {
        self.calls
            .push(CentralCall::SetNotify(link, characteristic, enabled));
    }
}

/// 取出通道里已有的全部事件
pub fn collect<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> Vec<E> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
