//! 交互控制台 - 把标准输入的行解析成命令，把事件打印到终端

use std::time::Duration;

use iotooth_core::{
    CentralCommand, CentralEvent, DeviceAddress, DiscoveredDevice, PeripheralCommand,
    PeripheralEvent, ScanEvent,
};
use tokio::sync::mpsc;

/// 外设模式下的一行输入
///
/// `enable` / `disable` 控制广播，其余内容作为文本发送。
pub fn parse_peripheral(line: &str) -> Option<PeripheralCommand> {
    let line = line.trim();
    match line {
        "" => None,
        "enable" => Some(PeripheralCommand::Enable),
        "disable" => Some(PeripheralCommand::Disable),
        text => Some(PeripheralCommand::SendText(text.to_string())),
    }
}

/// 中心模式下一行输入解析的结果
pub enum CentralInput {
    Command(CentralCommand),
    /// 扫描需要单独的回调通道
    Scan(Option<Duration>),
    Help,
    Invalid(String),
}

pub fn parse_central(line: &str) -> Option<CentralInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let input = match verb {
        "scan" if rest.is_empty() => CentralInput::Scan(None),
        "scan" => match rest.parse::<u64>() {
            Ok(secs) => CentralInput::Scan(Some(Duration::from_secs(secs))),
            Err(_) => CentralInput::Invalid(format!("invalid duration: {rest}")),
        },
        "stop" => CentralInput::Command(CentralCommand::StopScan),
        "connect" if !rest.is_empty() => CentralInput::Command(CentralCommand::Connect(
            DiscoveredDevice::new(rest),
        )),
        "disconnect" if rest == "all" => CentralInput::Command(CentralCommand::DisconnectAll),
        "disconnect" if !rest.is_empty() => {
            CentralInput::Command(CentralCommand::Disconnect(DeviceAddress::new(rest)))
        }
        "read" if !rest.is_empty() => {
            CentralInput::Command(CentralCommand::Read(DeviceAddress::new(rest)))
        }
        "send" => match rest.split_once(' ') {
            Some((address, text)) => CentralInput::Command(CentralCommand::SendText {
                address: DeviceAddress::new(address),
                text: text.to_string(),
            }),
            None => CentralInput::Invalid("usage: send <address> <text>".to_string()),
        },
        "help" => CentralInput::Help,
        other => CentralInput::Invalid(format!("unknown command: {other}")),
    };
    Some(input)
}

pub const CENTRAL_HELP: &str = "\
commands:
  scan [secs]              扫描带有服务 UUID 的外设
  stop                     停止扫描
  connect <address>        连接设备
  disconnect <address|all> 断开连接
  send <address> <text>    发送文本
  read <address>           读取只读特征";

pub async fn print_peripheral_events(mut rx: mpsc::UnboundedReceiver<PeripheralEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PeripheralEvent::StateChanged { state, context } => match context {
                Some(context) => println!("[state] {state} ({context})"),
                None => println!("[state] {state}"),
            },
            PeripheralEvent::Message { offset, data } => {
                println!("[recv] @{offset}: {}", String::from_utf8_lossy(&data));
            }
            PeripheralEvent::Error(e) => println!("[error] {e}"),
        }
    }
}

pub async fn print_central_events(mut rx: mpsc::UnboundedReceiver<CentralEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            CentralEvent::StateChanged { state, address } => println!("[state] {address}: {state}"),
            CentralEvent::Message { address, data } => {
                println!("[recv] {address}: {}", String::from_utf8_lossy(&data));
            }
            CentralEvent::Error(e) => println!("[error] {e}"),
        }
    }
}

pub async fn print_scan_events(mut rx: mpsc::UnboundedReceiver<ScanEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ScanEvent::Started => println!("[scan] started"),
            ScanEvent::Result(device) => println!(
                "[scan] {} {} rssi={}",
                device.address,
                device.name.as_deref().unwrap_or("<unknown>"),
                device
                    .rssi
                    .map_or_else(|| "?".to_string(), |r| r.to_string())
            ),
            ScanEvent::Stopped => println!("[scan] stopped"),
            ScanEvent::Failed(failure) => println!("[scan] failed: {failure}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_lines() {
        assert_eq!(parse_peripheral("  "), None);
        assert_eq!(parse_peripheral("enable"), Some(PeripheralCommand::Enable));
        assert_eq!(
            parse_peripheral("hello there\n"),
            Some(PeripheralCommand::SendText("hello there".into()))
        );
    }

    #[test]
    fn test_central_lines() {
        assert!(matches!(
            parse_central("scan 5"),
            Some(CentralInput::Scan(Some(d))) if d == Duration::from_secs(5)
        ));
        assert!(matches!(parse_central("scan"), Some(CentralInput::Scan(None))));
        assert!(matches!(
            parse_central("scan soon"),
            Some(CentralInput::Invalid(_))
        ));
        assert!(matches!(
            parse_central("disconnect all"),
            Some(CentralInput::Command(CentralCommand::DisconnectAll))
        ));
        assert!(matches!(
            parse_central("send AA:BB hi there"),
            Some(CentralInput::Command(CentralCommand::SendText { address, text }))
                if address.as_str() == "AA:BB" && text == "hi there"
        ));
        assert!(matches!(
            parse_central("connect"),
            Some(CentralInput::Invalid(_))
        ));
    }
}
