//! Joins a room on a running relay and prints mesh events.
//!
//!     cargo run --example join_room -- localhost:8080 demo

use std::sync::Arc;

use parley_mesh::link::webrtc::WebRtcLinkFactory;
use parley_mesh::{generate_session_id, MeshCoordinator, SignalingConnection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let relay = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "localhost:8080".to_string());
    let room = std::env::args().nth(2).unwrap_or_else(|| "demo".to_string());

    let session_id = generate_session_id();
    let signaling = SignalingConnection::connect(&relay, &room).await?;
    let factory = Arc::new(WebRtcLinkFactory::default());
    let (coordinator, handle, mut events) =
        MeshCoordinator::new(session_id.clone(), signaling, factory, Vec::new());
    tokio::spawn(coordinator.run());

    println!("joined room {room} as {session_id}; ctrl-c to leave");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.leave();
                // let the leave envelope flush before exiting
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                break;
            }
            event = events.recv() => match event {
                Some(event) => println!("{event:?}"),
                None => break,
            }
        }
    }
    Ok(())
}
