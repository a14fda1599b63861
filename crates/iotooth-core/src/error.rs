//! 错误类型
//!
//! 可恢复的状态错误（射频不可用、广播失败）通过回调上报，
//! 只有在 [`DeliveryPolicy::Strict`](crate::event::DeliveryPolicy) 下，
//! 被丢弃的发送和失败的链路才会以 `Err` 返回给调用者。

use crate::event::DropReason;
use crate::transport::{AdvertiseFailure, DeviceAddress, ScanFailure};

/// 状态机向调用者暴露的错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IotoothError {
    #[error("Bluetooth radio is unavailable")]
    RadioUnavailable,

    #[error("Advertising failed: {0} (code {code})", code = .0.code())]
    AdvertisingFailed(AdvertiseFailure),

    #[error("Scan failed: {0} (code {code})", code = .0.code())]
    ScanFailed(ScanFailure),

    #[error("Failed to open link to {0}")]
    LinkOpenFailed(DeviceAddress),

    #[error("Service discovery failed on {0}")]
    DiscoveryFailed(DeviceAddress),

    #[error("Message dropped: {0}")]
    Dropped(DropReason),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// 传输层（平台绑定）错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Adapter is powered off")]
    PoweredOff,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(uuid::Uuid),

    #[cfg(feature = "bluer")]
    #[error("BlueZ error: {0}")]
    Bluer(#[from] bluer::Error),

    #[cfg(feature = "btleplug")]
    #[error("btleplug error: {0}")]
    Btleplug(#[from] btleplug::Error),

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for IotoothError {
    fn from(e: TransportError) -> Self {
        IotoothError::Transport(e.to_string())
    }
}

pub type Result<T, E = IotoothError> = std::result::Result<T, E>;
