//! AnyShare CLI
//!
//! 命令行客户端: 房间码校验、会话 REST 调用和本地回环传输

mod loopback;

use anyhow::{Context, Result};
use anyshare_core::{AppSettings, SessionApi, is_valid_room_code};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "anyshare", version, about = "AnyShare - 房间码点对点文件传输")]
struct Cli {
    /// 设置文件路径（默认: 配置目录下的 anyshare/settings.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 校验房间码格式
    CheckCode {
        /// 房间码，例如 SWIFT-7284
        code: String,
    },
    /// 创建会话并加入
    Create,
    /// 查询会话
    Info {
        code: String,
    },
    /// 加入会话
    Join {
        code: String,
    },
    /// 关闭会话
    Close {
        session_id: String,
        /// 加入会话时拿到的 token
        #[arg(short, long)]
        token: String,
    },
    /// 在本进程内的两个节点之间传输文件
    Loopback {
        /// 要发送的文件路径
        file: PathBuf,
        /// 保存目录 (默认: 设置中的下载目录)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 使用小水位线预设
        #[arg(long)]
        conservative: bool,
    },
    /// 查看设置
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// 打印生效的设置
    Show,
    /// 打印设置文件路径
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（anyshare-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,anyshare_core=debug")),
        )
        .try_init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(AppSettings::config_path);
    let settings = AppSettings::load_from(&config_path);
    tracing::debug!("Using settings file {}", config_path.display());

    match cli.command {
        Commands::CheckCode { code } => {
            if is_valid_room_code(&code) {
                println!("✅ {code} 格式正确");
            } else {
                anyhow::bail!("房间码格式错误: {code}（应为 WORD-NNNN，例如 SWIFT-7284）");
            }
        }
        Commands::Create => {
            let api = SessionApi::from_settings(&settings)?;
            let (created, session) = api.create_and_join().await.context("创建会话失败")?;
            println!("🏠 房间码: {}", created.room_code);
            println!("   会话 ID: {}", session.session_id);
            println!("   节点 ID: {}", session.local_peer_id);
            println!("   Token:   {}", session.token);
            println!("   过期时间: {}", session.expires_at);
        }
        Commands::Info { code } => {
            let api = SessionApi::from_settings(&settings)?;
            let info = api.session_info(&code).await?;
            println!("会话 {}: {}", info.session_id, info.status);
            println!("   节点: {}/{}", info.peers_connected, info.max_peers);
            println!("   可加入: {}", if info.can_join { "是" } else { "否" });
            println!("   过期时间: {}", info.expires_at);
        }
        Commands::Join { code } => {
            let api = SessionApi::from_settings(&settings)?;
            let (session, joined) = api.join_session(&code).await.context("加入会话失败")?;
            println!("🔗 已加入 {}", session.room_code);
            println!("   会话 ID: {}", session.session_id);
            println!("   节点 ID: {}", session.local_peer_id);
            println!("   Token:   {}", session.token);
            if let Some(ws_url) = joined.ws_url {
                println!("   信令地址: {ws_url}");
            }
        }
        Commands::Close { session_id, token } => {
            let api = SessionApi::from_settings(&settings)?;
            api.close_session(&session_id, &token).await?;
            println!("⏹️  会话 {session_id} 已关闭");
        }
        Commands::Loopback {
            file,
            output,
            conservative,
        } => {
            let output = output.unwrap_or_else(|| settings.download_dir.clone());
            loopback::run(&settings, &file, &output, conservative).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                print!("{}", toml::to_string_pretty(&settings)?);
            }
            ConfigAction::Path => println!("{}", config_path.display()),
        },
    }

    Ok(())
}
