//! Basic cowrite Example
//!
//! Two users editing one document through an embedded session manager.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;
use std::time::Duration;

use cowrite_core::{DocumentId, EditSubmission, EngineConfig, SessionEvent, SessionManager};
use cowrite_storage::{MemoryStorage, Storage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("cowrite Basic Example\n");

    let storage = Arc::new(MemoryStorage::new());
    let manager = Arc::new(SessionManager::new(storage.clone(), EngineConfig::default()));
    manager.start();

    let id = DocumentId::new("doc1")?;
    let alice = manager.attach(&id, "alice", "Alice").await?;
    let mut bob = manager.attach(&id, "bob", "Bob").await?;
    println!("Alice is {} and Bob is {}", alice.color, bob.color);

    let edit = |user: &str, base_revision, content: &str, client_seq| EditSubmission {
        document_id: id.clone(),
        user_id: user.to_string(),
        client_id: format!("{}-demo", user),
        base_revision,
        content: content.to_string(),
        client_seq,
    };

    let applied = alice.session.submit(alice.token, edit("alice", 0, "Hello", 1)).await?;
    println!("Alice: rev {} {:?}", applied.revision, applied.content);

    let applied = bob
        .session
        .submit(bob.token, edit("bob", applied.revision, "Hello world", 1))
        .await?;
    println!("Bob:   rev {} {:?}", applied.revision, applied.content);

    // Alice's resend of seq 1 is answered without a new revision
    let retry = alice.session.submit(alice.token, edit("alice", 0, "Hello", 1)).await;
    println!("Alice retry: {:?}", retry.err());

    // What Bob's connection was sent
    while let Ok(event) = bob.events.try_recv() {
        match event {
            SessionEvent::Broadcast {
                revision,
                content,
                from_user,
                ..
            } => println!("  bob <- rev {} from {}: {:?}", revision, from_user, content),
            SessionEvent::Presence(users) => println!("  bob <- {} user(s) present", users.len()),
            SessionEvent::SaveStatus(status) => println!("  bob <- save status {:?}", status),
        }
    }

    manager.detach(&alice.session, alice.token);
    manager.detach(&bob.session, bob.token);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Retirement and shutdown both flush pending writes
    manager.shutdown().await;

    if let Some(stored) = storage.get("doc1").await? {
        println!("\nStored: rev {} {:?}", stored.revision, stored.content);
    }

    Ok(())
}
