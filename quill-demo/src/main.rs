//! Quill demo — two participants sharing one room on an in-process hub.
//!
//! Usage: `quill-demo [config.json]`. Set `RUST_LOG=debug` to watch the
//! session state machine.

mod presence;

use std::error::Error;
use std::time::Duration;

use log::info;

use presence::Roster;
use quill_collab::{
    Connector, Document, LocalHub, LocalIdentity, SessionConfig, SessionManager, SessionState,
    DEFAULT_FRAGMENT,
};

const ROOM: &str = "collab-editor-demo-room";
const WELCOME: &str = "Start collaborating!";
const NOTES: &str = "notes";
const SETTLE: Duration = Duration::from_millis(50);

fn load_config() -> Result<SessionConfig, Box<dyn Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)?;
            info!("Loaded session config from {path}");
            Ok(SessionConfig::from_json(&json)?)
        }
        None => Ok(SessionConfig::default()),
    }
}

/// Wait until `session` reports a state matching `pred`.
async fn wait_for<C: Connector>(
    session: &SessionManager<C>,
    pred: impl FnMut(&SessionState) -> bool,
) -> Result<SessionState, Box<dyn Error>> {
    let mut states = session.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(10), states.wait_for(pred)).await??;
    Ok(state.clone())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Quill demo...");
    let config = load_config()?;
    let hub = LocalHub::new();

    let alice = SessionManager::new(hub.clone(), Document::new(), config.clone());
    let bob = SessionManager::new(hub.clone(), Document::new(), config);
    let roster = Roster::new(bob.presence());

    alice.enter(ROOM, LocalIdentity::new("alice"))?;
    wait_for(&alice, SessionState::is_synced).await?;
    if alice.document().initialize_if_empty(DEFAULT_FRAGMENT, WELCOME) {
        info!("alice seeded the document");
    }

    bob.enter(ROOM, LocalIdentity::new("bob"))?;
    wait_for(&bob, SessionState::is_synced).await?;
    info!("bob sees: {}", bob.document().to_xml_string(DEFAULT_FRAGMENT));

    bob.document().initialize_if_empty(NOTES, "bob was here");
    tokio::time::sleep(SETTLE).await;
    info!("alice sees notes: {}", alice.document().to_xml_string(NOTES));

    alice.cursors().publish_cursor(10.0, 20.0);
    bob.cursors().publish_cursor(42.0, 7.5);
    tokio::time::sleep(SETTLE).await;

    for user in roster.collaborators() {
        info!("in room: {} ({})", user.name, user.color);
    }
    for label in roster.cursor_labels() {
        info!("bob sees cursor: {label}");
    }

    if let Some(id) = alice.client_id() {
        info!("injecting a connection error for alice (client {id})");
        hub.fail(id, "simulated ICE failure");
        wait_for(&alice, |s| *s == SessionState::Connecting).await?;
        let state = wait_for(&alice, |s| s.is_synced() || s.error().is_some()).await?;
        info!(
            "alice is {state} after {} reconnect attempt(s), now client {:?}",
            alice.attempts(),
            alice.client_id()
        );
    }

    alice.cursors().hide_cursor();
    tokio::time::sleep(SETTLE).await;
    info!("bob sees {} remote cursor(s)", roster.cursor_labels().len());

    alice.leave();
    bob.leave();
    info!("Demo finished; {} room(s) left open", hub.room_count());
    Ok(())
}
