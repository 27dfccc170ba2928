use std::net::SocketAddr;
use std::path::Path;

use blockdev::agent;
use blockdev::config::AgentConfig;

/// Boots an agent on an ephemeral port; returns its address and token.
pub async fn spawn_agent(data_dir: &Path) -> (SocketAddr, String) {
    let state = agent::bootstrap(AgentConfig {
        port: 0,
        data_dir: data_dir.to_path_buf(),
    })
    .await
    .unwrap();
    let token = state.token.to_string();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, agent::router(state)).await.unwrap();
    });
    (addr, token)
}
