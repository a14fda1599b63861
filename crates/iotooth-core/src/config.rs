//! 角色配置和持久化
//!
//! UUID 在会话生命周期内固定；要更换必须销毁并重建会话。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::event::DeliveryPolicy;
use crate::transport::{
    AdvertiseParams, CharacteristicDefinition, CharacteristicProperties, ServiceDefinition,
};

pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x1b3f1e30_0f15_4f98_8d69_d2b97f4ceddf);
pub const DEFAULT_READONLY_UUID: Uuid = Uuid::from_u128(0x1b3f1e31_0f15_4f98_8d69_d2b97f4ceddf);
pub const DEFAULT_WRITABLE_UUID: Uuid = Uuid::from_u128(0x1b3f1e32_0f15_4f98_8d69_d2b97f4ceddf);

/// 默认扫描时长（毫秒）
pub const DEFAULT_SCAN_MILLIS: u64 = 10_000;

/// 外设角色配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeripheralConfig {
    /// 广播并注册的服务 UUID
    pub service_uuid: Uuid,
    /// 只读 + 通知特征（外设 -> 中心）
    pub readonly_uuid: Uuid,
    /// 可写特征（中心 -> 外设）
    pub writable_uuid: Uuid,
    /// 广播中携带的设备名
    pub local_name: Option<String>,
    pub include_tx_power: bool,
    pub delivery: DeliveryPolicy,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_UUID)
    }
}

impl PeripheralConfig {
    /// 使用默认特征 UUID
    pub fn new(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            readonly_uuid: DEFAULT_READONLY_UUID,
            writable_uuid: DEFAULT_WRITABLE_UUID,
            local_name: Some(get_default_device_name()),
            include_tx_power: true,
            delivery: DeliveryPolicy::default(),
        }
    }

    pub fn with_characteristics(mut self, readonly: Uuid, writable: Uuid) -> Self {
        self.readonly_uuid = readonly;
        self.writable_uuid = writable;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn advertise_params(&self) -> AdvertiseParams {
        AdvertiseParams {
            service_uuid: self.service_uuid,
            connectable: true,
            local_name: self.local_name.clone(),
            include_tx_power: self.include_tx_power,
        }
    }

    /// 一个主服务：一个 read+notify 特征，一个 write+notify 特征
    pub fn service_definition(&self) -> ServiceDefinition {
        ServiceDefinition {
            uuid: self.service_uuid,
            primary: true,
            characteristics: vec![
                CharacteristicDefinition {
                    uuid: self.readonly_uuid,
                    properties: CharacteristicProperties::READ_NOTIFY,
                },
                CharacteristicDefinition {
                    uuid: self.writable_uuid,
                    properties: CharacteristicProperties::WRITE_NOTIFY,
                },
            ],
        }
    }
}

/// 中心角色配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// 扫描过滤用的服务 UUID
    pub service_uuid: Uuid,
    /// 对端的只读 + 通知特征
    pub readonly_uuid: Uuid,
    /// 对端的可写特征
    pub writable_uuid: Uuid,
    pub scan_millis: u64,
    pub delivery: DeliveryPolicy,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_UUID)
    }
}

impl CentralConfig {
    pub fn new(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            readonly_uuid: DEFAULT_READONLY_UUID,
            writable_uuid: DEFAULT_WRITABLE_UUID,
            scan_millis: DEFAULT_SCAN_MILLIS,
            delivery: DeliveryPolicy::default(),
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_millis)
    }
}

/// 应用设置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub peripheral: PeripheralConfig,
    pub central: CentralConfig,
}

impl Settings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("iotooth");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "IoTooth".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_definition_layout() {
        let config = PeripheralConfig::new(DEFAULT_SERVICE_UUID);
        let service = config.service_definition();

        assert!(service.primary);
        assert_eq!(service.characteristics.len(), 2);

        let readonly = service.characteristic(DEFAULT_READONLY_UUID).unwrap();
        assert!(readonly.properties.read && readonly.properties.notify);
        assert!(!readonly.properties.write);

        let writable = service.characteristic(DEFAULT_WRITABLE_UUID).unwrap();
        assert!(writable.properties.write && writable.properties.notify);
        assert!(!writable.properties.read);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [central]
            scan_millis = 500
            delivery = "strict"
            "#,
        )
        .unwrap();

        assert_eq!(settings.central.scan_duration(), Duration::from_millis(500));
        assert_eq!(settings.central.delivery, DeliveryPolicy::Strict);
        assert_eq!(settings.central.service_uuid, DEFAULT_SERVICE_UUID);
        assert_eq!(settings.peripheral.service_uuid, DEFAULT_SERVICE_UUID);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("iotooth-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("settings.toml");

        let mut settings = Settings::default();
        settings.peripheral.local_name = Some("bench".to_string());
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded, settings);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let loaded = Settings::load_from(std::path::Path::new("/nonexistent/iotooth.toml"));
        assert_eq!(loaded.central.scan_millis, DEFAULT_SCAN_MILLIS);
    }
}
