//! Linux 平台绑定
//!
//! - **server** (`bluer` 特性): BlueZ D-Bus 上的广播 + GATT Server，实现
//!   [`PeripheralTransport`](crate::transport::PeripheralTransport)
//! - **client** (`btleplug` 特性): 扫描 + GATT 客户端，实现
//!   [`CentralTransport`](crate::transport::CentralTransport)
//!
//! 两个绑定都把异步操作派发到 tokio 任务上，结果通过事件通道送回状态机，
//! 因此必须在 tokio 运行时内构造和调用。

#[cfg(feature = "btleplug")]
pub mod client;
#[cfg(feature = "bluer")]
pub mod server;

#[cfg(feature = "btleplug")]
pub use client::BtleplugCentral;
#[cfg(feature = "bluer")]
pub use server::BluerPeripheral;
