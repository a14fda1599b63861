//! IoTooth CLI
//!
//! 在终端里运行外设或中心角色，标准输入作为命令，事件打印到标准输出

mod console;

use anyhow::Result;
use clap::{Parser, Subcommand};
use iotooth_core::{
    BluerPeripheral, BtleplugCentral, Central, CentralCommand, DeliveryPolicy, PeripheralCommand,
    PeripheralSession, Settings,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use console::CentralInput;

#[derive(Parser)]
#[command(name = "iotooth", version, about = "BLE 外设/中心连接演示")]
struct Cli {
    /// 服务 UUID (默认读取配置文件)
    #[arg(short, long, global = true)]
    service: Option<Uuid>,

    /// 发送失败时报告错误而不是静默丢弃
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 作为外设广播服务并等待中心设备连接
    Peripheral {
        /// 广播使用的设备名称
        #[arg(short, long)]
        name: Option<String>,
    },
    /// 作为中心扫描并连接外设
    Central {
        /// 默认扫描时长 (秒)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// 显示配置文件路径和当前设置
    Config {
        /// 把当前设置（含命令行覆盖）写入配置文件
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（iotooth-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,iotooth_core=debug")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let mut settings = Settings::load();
    if let Some(service) = cli.service {
        settings.peripheral.service_uuid = service;
        settings.central.service_uuid = service;
    }
    if cli.strict {
        settings.peripheral.delivery = DeliveryPolicy::Strict;
        settings.central.delivery = DeliveryPolicy::Strict;
    }

    match cli.command {
        Commands::Peripheral { name } => {
            if name.is_some() {
                settings.peripheral.local_name = name;
            }
            run_peripheral(settings).await
        }
        Commands::Central { timeout } => {
            if let Some(secs) = timeout {
                settings.central.scan_millis = secs.saturating_mul(1000);
            }
            run_central(settings).await
        }
        Commands::Config { save } => {
            println!("# {}", Settings::config_path().display());
            println!("{settings:#?}");
            if save {
                settings.save()?;
                println!("saved");
            }
            Ok(())
        }
    }
}

async fn run_peripheral(settings: Settings) -> Result<()> {
    let transport = BluerPeripheral::new().await?;
    tracing::info!("Using adapter {}", transport.adapter_name());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = PeripheralSession::new(settings.peripheral, transport, event_tx);
    tokio::spawn(console::print_peripheral_events(event_rx));

    let (commands, inbox) = mpsc::channel(16);
    let owner = tokio::spawn(session.run(inbox));
    commands
        .send(PeripheralCommand::Enable)
        .await
        .map_err(|_| anyhow::anyhow!("peripheral session stopped"))?;

    println!("输入文本发送给已连接的中心设备，enable/disable 控制广播，Ctrl-D 退出");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if let Some(command) = console::parse_peripheral(&line)
                    && commands.send(command).await.is_err()
                {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(commands);
    let session = owner.await?;
    tracing::info!("Peripheral stopped in state {}", session.state());
    Ok(())
}

async fn run_central(settings: Settings) -> Result<()> {
    let transport = BtleplugCentral::new().await?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let default_scan = settings.central.scan_duration();
    let central = Central::new(settings.central, transport, event_tx);
    tokio::spawn(console::print_central_events(event_rx));

    let (commands, inbox) = mpsc::channel(16);
    let owner = tokio::spawn(central.run(inbox));

    println!("{}", console::CENTRAL_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = match console::parse_central(&line) {
                    Some(CentralInput::Command(command)) => command,
                    Some(CentralInput::Scan(duration)) => {
                        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
                        tokio::spawn(console::print_scan_events(scan_rx));
                        CentralCommand::Scan {
                            duration: duration.unwrap_or(default_scan),
                            callback: Box::new(scan_tx),
                        }
                    }
                    Some(CentralInput::Help) => {
                        println!("{}", console::CENTRAL_HELP);
                        continue;
                    }
                    Some(CentralInput::Invalid(message)) => {
                        println!("{message}");
                        continue;
                    }
                    None => continue,
                };
                if commands.send(command).await.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(commands);
    let central = owner.await?;
    tracing::info!(
        "Central stopped, {} link(s) remained",
        central.registry().len()
    );
    Ok(())
}
