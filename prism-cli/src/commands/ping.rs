use anyhow::Result;
use prism_provision::rpc::RpcCoreAdmin;
use std::net::SocketAddr;
use std::time::Duration;

/// Check that a core-admin server answers
pub async fn run_ping(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let admin = RpcCoreAdmin::new(timeout);
    let node = addr.to_string();
    admin.connect_node(&node, addr).await?;
    let reply = admin.ping(&node).await?;
    println!("{}: {}", addr, reply);
    Ok(())
}
