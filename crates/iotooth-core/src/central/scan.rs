//! 扫描窗口 - 有时限的单次扫描
//!
//! 窗口只是一个截止时间加一个回调，计时由 [`Central`](super::Central)
//! 的事件循环等待，不存在游离的定时任务。新扫描直接替换旧窗口，
//! 旧窗口的回调不会再收到 `on_scan_stopped`。

use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;
use uuid::Uuid;

use crate::event::ScanCallback;
use crate::transport::{CentralTransport, DiscoveredDevice, ScanFailure, ScanId};

/// 时长溢出时使用的截止时间，约 30 年
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub struct ScanWindow {
    id: ScanId,
    filter: Uuid,
    deadline: Instant,
    callback: Box<dyn ScanCallback>,
}

impl ScanWindow {
    /// 立即开始过滤扫描并记录截止时间
    pub fn start<T: CentralTransport>(
        transport: &mut T,
        id: ScanId,
        filter: Uuid,
        duration: Duration,
        callback: Box<dyn ScanCallback>,
    ) -> Self {
        info!(
            "Starting BLE scan {:?} for {} ms, filter={}",
            id,
            duration.as_millis(),
            filter
        );
        callback.on_scan_started();
        transport.start_scan(id, filter);
        Self {
            id,
            filter,
            deadline: deadline_after(Instant::now(), duration),
            callback,
        }
    }

    pub fn id(&self) -> ScanId {
        self.id
    }

    pub fn filter(&self) -> Uuid {
        self.filter
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// 转发一条扫描结果，不去重
    pub fn deliver(&self, device: &DiscoveredDevice) {
        self.callback.on_scan_result(device);
    }

    pub fn report_failure(&self, failure: ScanFailure) {
        self.callback.on_scan_failed(failure);
    }

    /// 停止扫描并通知回调，窗口随之销毁，因此只会通知一次
    pub fn stop<T: CentralTransport>(self, transport: &mut T) {
        transport.stop_scan(self.id);
        info!("BLE scan {:?} stopped", self.id);
        self.callback.on_scan_stopped();
    }

    /// 被新窗口替换：不停止传输层扫描，也不通知
    pub fn supersede(self) {
        debug!("Scan {:?} superseded", self.id);
    }
}

fn deadline_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}
