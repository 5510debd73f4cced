//! 本地回环: 两个节点在同一进程里走完整的建连和传输流程

use anyhow::{Context, Result, bail};
use anyshare_core::signaling::RelayMember;
use anyshare_core::{
    AppSettings, DeviceType, FileSource, MemoryNetwork, MemoryRelay, NegotiationState,
    SessionActor, SessionHandle, TransferConfig, TransferStatus, format_bytes, format_speed,
    format_time_remaining,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn spawn_peer(
    member: RelayMember,
    network: &Arc<MemoryNetwork>,
    settings: &AppSettings,
) -> Result<SessionHandle> {
    let RelayMember {
        session,
        link,
        inbound,
    } = member;
    let (handle, _task) =
        SessionActor::spawn(session, link, inbound, Arc::new(network.factory()), settings)?;
    Ok(handle)
}

async fn wait_connected(handle: &SessionHandle) -> Result<()> {
    let mut state = handle.negotiation_state();
    timeout(
        CONNECT_TIMEOUT,
        state.wait_for(|s| *s == NegotiationState::Connected || *s == NegotiationState::Failed),
    )
    .await
    .context("连接超时")??;
    if *state.borrow() == NegotiationState::Failed {
        bail!("连接失败");
    }
    Ok(())
}

pub async fn run(settings: &AppSettings, file: &Path, output: &Path, conservative: bool) -> Result<()> {
    let mut settings = settings.clone();
    if conservative {
        settings.transfer = TransferConfig::conservative();
    }

    let source = FileSource::open(file)
        .await
        .with_context(|| format!("无法打开 {}", file.display()))?;

    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();

    let host = relay.create_session(settings.device_type);
    let room = host.session.room_code.clone();
    println!("🏠 房间码: {room}");

    let sender = spawn_peer(host, &network, &settings)?;
    let guest = relay.join(&room, DeviceType::Desktop)?;
    let receiver = spawn_peer(guest, &network, &settings)?;

    wait_connected(&sender).await?;
    wait_connected(&receiver).await?;
    println!("🔗 连接已建立");

    println!(
        "📤 发送文件: {} ({})",
        source.name(),
        format_bytes(source.size() as f64)
    );

    let mut progress = sender.transfer_state();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let state = progress.borrow_and_update().clone();
            if state.status != TransferStatus::InProgress {
                continue;
            }
            println!(
                "   {:>3}%  {}  剩余 {}",
                state.progress,
                format_speed(state.speed),
                format_time_remaining(state.remaining_secs())
            );
        }
    });

    let result = sender.send_file(source).await;
    reporter.abort();
    result?;

    // 接收端可能还停在 Idle，必须等到 Complete 或 Error
    let state = timeout(CONNECT_TIMEOUT, receiver.wait_transfer_settled())
        .await
        .context("接收超时")??;
    if let Some(error) = state.error {
        bail!("接收失败: {error}");
    }

    let received = receiver.materialize().await?;
    let path = received.save_to(output).await?;
    println!(
        "📥 已接收 {} ({})，保存到 {}",
        received.name,
        format_bytes(received.size() as f64),
        path.display()
    );

    sender.leave().await;
    receiver.leave().await;
    Ok(())
}
