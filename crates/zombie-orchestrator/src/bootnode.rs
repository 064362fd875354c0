//! Bootnode multiaddress generation.

use crate::error::Result;
use crate::keys::KeyGenerator;
use crate::topology::Node;

/// Builds the multiaddress other nodes use to reach `peer_id`.
///
/// A user supplied `--listen-addr` is reused with its address and port
/// replaced; otherwise a websocket address is produced.
pub fn multiaddress(peer_id: &str, ip: &str, port: u16, args: &[String]) -> String {
    let listen_addr = args
        .iter()
        .position(|a| a == "--listen-addr")
        .and_then(|idx| args.get(idx + 1));

    match listen_addr {
        Some(addr) => {
            let mut parts: Vec<String> = addr.split('/').map(str::to_string).collect();
            if parts.len() > 4 {
                parts[2] = ip.to_string();
                parts[4] = port.to_string();
            }
            format!("{}/p2p/{peer_id}", parts.join("/"))
        }
        None => format!("/ip4/{ip}/tcp/{port}/ws/p2p/{peer_id}"),
    }
}

/// Resolves the peer id of `node` and returns its multiaddress.
pub async fn bootnode_address(node: &Node, ip: &str, port: u16, keys: &dyn KeyGenerator) -> Result<String> {
    let peer_id = keys.peer_id(&node.key).await?;
    Ok(multiaddress(&peer_id, ip, port, &node.args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::FakeKeyGenerator;
    use crate::topology::NodeRole;

    #[test]
    fn test_default_multiaddress() {
        assert_eq!(
            multiaddress("12D3KooWabc", "10.0.0.2", 30333, &[]),
            "/ip4/10.0.0.2/tcp/30333/ws/p2p/12D3KooWabc"
        );
    }

    #[test]
    fn test_listen_addr_is_rewritten() {
        let args = vec![
            "--listen-addr".to_string(),
            "/ip4/0.0.0.0/tcp/30333".to_string(),
        ];
        assert_eq!(
            multiaddress("12D3KooWabc", "127.0.0.1", 41000, &args),
            "/ip4/127.0.0.1/tcp/41000/p2p/12D3KooWabc"
        );
    }

    #[tokio::test]
    async fn test_bootnode_address_uses_node_key() {
        let node = Node::builder("alice", NodeRole::Node).build();
        let addr = bootnode_address(&node, "10.1.1.1", 30333, &FakeKeyGenerator).await.unwrap();
        assert_eq!(addr, format!("/ip4/10.1.1.1/tcp/30333/ws/p2p/12D3KooW{}", &node.key[..16]));
    }
}
