//! IoTooth Core Library
//!
//! 单设备上两种 BLE 角色的连接生命周期管理：
//!
//! - **peripheral**: 广播一个 GATT 服务，只接受一个中心设备连接，
//!   通过特征收发字节消息，断开后自动恢复广播
//! - **central**: 按服务 UUID 限时扫描，同时维护多条按地址索引的 GATT 链路
//!
//! 射频通过 [`transport`] 中的 trait 抽象；`bluer` / `btleplug` 特性提供
//! Linux 上的实际绑定。
//!
//! # 使用示例
//!
//! ## 外设
//!
//! ```ignore
//! use iotooth_core::{BluerPeripheral, PeripheralConfig, PeripheralSession};
//!
//! let transport = BluerPeripheral::new().await?;
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let mut session = PeripheralSession::new(PeripheralConfig::default(), transport, tx);
//! session.enable();
//! loop {
//!     session.process_next().await;
//! }
//! ```
//!
//! ## 中心
//!
//! ```ignore
//! use iotooth_core::{BtleplugCentral, Central, CentralConfig};
//!
//! let transport = BtleplugCentral::new().await?;
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let mut central = Central::new(CentralConfig::default(), transport, tx);
//! central.scan_with_duration(Duration::from_secs(5), scan_tx);
//! ```

pub mod ble;
pub mod central;
pub mod config;
pub mod error;
pub mod event;
pub mod peripheral;
pub mod transport;

pub use central::{
    Central, CentralCommand, CentralLinkHandler, ConnectionRegistry, LinkPhase, ScanWindow,
};
pub use config::{CentralConfig, PeripheralConfig, Settings};
pub use error::{IotoothError, Result, TransportError};
pub use event::{
    CentralCallback, CentralEvent, CentralState, Delivery, DeliveryPolicy, DropReason,
    PeripheralCallback, PeripheralEvent, PeripheralState, ScanCallback, ScanEvent,
};
pub use peripheral::{PeripheralCommand, PeripheralSession};
pub use transport::{CentralTransport, DeviceAddress, DiscoveredDevice, PeripheralTransport};

#[cfg(feature = "btleplug")]
pub use ble::BtleplugCentral;
#[cfg(feature = "bluer")]
pub use ble::BluerPeripheral;
