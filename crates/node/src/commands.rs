use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use peerlog_session::{
    LanTransport, PeerId, PeerState, Recipients, SessionEvent, SessionManager,
};
use peerlog_store::{FilterPreset, GitHubSource, RecordStore, RocksBackend};

use crate::config::NodeConfig;
use crate::inbox;

type CmdResult<T = ()> = Result<T, Box<dyn Error>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const SHARE_GRACE: Duration = Duration::from_secs(2);

async fn start_session(config: &NodeConfig) -> CmdResult<SessionManager> {
    let session_config = config.session();
    let (transport, events) = LanTransport::bind(&session_config).await?;
    info!("Peer: {} (port {})", config.name, transport.port());
    info!("Service: {}", config.service_type);

    Ok(SessionManager::start(session_config, Arc::new(transport), events)?)
}

/// Log session events until interrupted, writing received payloads to the inbox.
async fn serve(session: &SessionManager, inbox_dir: &Path) -> CmdResult {
    let mut events = session.subscribe();
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => {
                info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::DataReceived { peer, payload }) => {
                    match inbox::store_payload(inbox_dir, &peer, &payload).await {
                        Ok(path) => info!("Received {} bytes from {} -> {}", payload.len(), peer, path.display()),
                        Err(e) => warn!("Could not store payload from {}: {}", peer, e),
                    }
                }
                Ok(SessionEvent::PeerStateChanged { peer, state }) => {
                    info!("{} is now {:?}", peer, state);
                }
                Ok(SessionEvent::SendFailed { peer, reason }) => {
                    warn!("Send to {} failed: {}", peer, reason);
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} session events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

pub async fn host(config: &NodeConfig) -> CmdResult {
    let session = start_session(config).await?;
    session.start_hosting().await?;
    info!("Hosting; received payloads go to {}", config.inbox_dir().display());

    let result = serve(&session, &config.inbox_dir()).await;
    session.shutdown().await?;
    result
}

/// Browse until `wanted` (or any peer) shows up, select it and wait for
/// the connection to settle.
async fn connect_to_peer(session: &SessionManager, wanted: Option<&str>) -> CmdResult<PeerId> {
    let mut states = session.subscribe_filtered("peer.state");
    let mut browser = session.start_browsing().await?;
    info!("Browsing for peers...");

    let target = loop {
        match browser.next_peer().await {
            Some(peer) if wanted.map_or(true, |name| peer.display_name() == name) => break peer,
            Some(peer) => debug!("Ignoring {}", peer),
            None => return Err("browsing ended before a peer was found".into()),
        }
    };

    info!("Connecting to {}", target);
    browser.select(&target).await?;

    let settled = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while let Some(event) = states.recv().await {
            if let SessionEvent::PeerStateChanged { peer, state } = event {
                if peer == target {
                    match state {
                        PeerState::Connected => return true,
                        PeerState::Disconnected => return false,
                        _ => {}
                    }
                }
            }
        }
        false
    })
    .await;

    match settled {
        Ok(true) => Ok(target),
        Ok(false) => Err(format!("could not connect to {}", target).into()),
        Err(_) => Err(format!("timed out connecting to {}", target).into()),
    }
}

pub async fn join(config: &NodeConfig, peer: Option<String>) -> CmdResult {
    let session = start_session(config).await?;
    let result = match connect_to_peer(&session, peer.as_deref()).await {
        Ok(target) => {
            info!("Joined {}", target);
            serve(&session, &config.inbox_dir()).await
        }
        Err(e) => Err(e),
    };
    session.shutdown().await?;
    result
}

pub async fn share(config: &NodeConfig, file: &Path, peer: Option<String>) -> CmdResult {
    let payload = tokio::fs::read(file).await?;
    let session = start_session(config).await?;

    let result = send_file(&session, file, payload, peer.as_deref()).await;
    session.shutdown().await?;
    result
}

async fn send_file(
    session: &SessionManager,
    file: &Path,
    payload: Vec<u8>,
    peer: Option<&str>,
) -> CmdResult {
    let target = connect_to_peer(session, peer).await?;
    let mut failures = session.subscribe_filtered("peer.send_failed");

    session.send(payload, Recipients::one(target.clone()))?;

    // A failure arrives as an event; silence within the grace period means delivered.
    match tokio::time::timeout(SHARE_GRACE, failures.recv()).await {
        Ok(Some(SessionEvent::SendFailed { reason, .. })) => {
            Err(format!("sending {} failed: {}", file.display(), reason).into())
        }
        _ => {
            info!("Shared {} with {}", file.display(), target);
            Ok(())
        }
    }
}

fn open_store(config: &NodeConfig) -> CmdResult<RecordStore> {
    let dir = config.store_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(RecordStore::open(RocksBackend::open(&dir)?)?)
}

pub async fn sync(config: &NodeConfig, repo: &str, pages: u32) -> CmdResult {
    let store = open_store(config)?;
    let source = GitHubSource::from_slug(repo)?;

    let merged = peerlog_store::sync(&store, &source, pages).await?;
    println!("Merged {} commits from {} ({} stored)", merged, repo, store.len());
    Ok(())
}

pub fn commits(config: &NodeConfig, preset: &FilterPreset) -> CmdResult {
    let store = open_store(config)?;
    let filter = preset.to_filter(Utc::now());
    let records = store.query(filter.as_ref());

    if records.is_empty() {
        println!("No commits match '{}'", preset);
        return Ok(());
    }

    for record in records {
        let sha = record.sha.get(..10).unwrap_or(&record.sha);
        let subject = record.message.lines().next().unwrap_or_default();
        println!(
            "{}  {}  {:<20}  {}",
            record.date.format("%Y-%m-%d %H:%M"),
            sha,
            record.author,
            subject
        );
    }
    Ok(())
}
