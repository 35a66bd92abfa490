//! HTTP-JSON control plane client
//!
//! Registration-style calls retry with exponential backoff capped at
//! 60 s; read-style calls fail fast and let the caller fall back to its
//! last known state.

use std::time::Duration;

use backoff::ExponentialBackoff;
use serde::Serialize;

use crate::error::ControlError;
use crate::nat::PeerNatInfo;
use crate::peer::PeerIdentity;

use super::{ControlPlane, PartyInfo, PeerDescriptor, RelayInfo};

const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_GIVE_UP: Duration = Duration::from_secs(120);

/// Control plane over HTTP-JSON
pub struct HttpControlPlane {
    base: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    party_id: &'a str,
    name: &'a str,
    host: PeerDescriptor,
}

#[derive(Serialize)]
struct JoinBody {
    peer: PeerDescriptor,
}

#[derive(Serialize)]
struct LeaveBody<'a> {
    peer_id: &'a str,
}

impl HttpControlPlane {
    pub fn new(base_url: &str) -> Self {
        HttpControlPlane {
            base: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_interval: BACKOFF_CAP,
            max_elapsed_time: Some(BACKOFF_GIVE_UP),
            ..ExponentialBackoff::default()
        }
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response, ControlError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base))
            .json(body)
            .send()
            .await
            .map_err(unreachable)?;
        Ok(response)
    }

    async fn expect_ok(
        response: reqwest::Response,
        not_found: impl FnOnce() -> ControlError,
    ) -> Result<reqwest::Response, ControlError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            reqwest::StatusCode::NOT_FOUND => Err(not_found()),
            status => Err(ControlError::Protocol {
                message: format!("unexpected status {status}"),
            }),
        }
    }
}

fn unreachable(e: reqwest::Error) -> ControlError {
    if e.is_connect() || e.is_timeout() {
        ControlError::Unreachable {
            message: e.to_string(),
        }
    } else {
        ControlError::Http(e)
    }
}

/// Only transport-level failures are worth retrying
fn transient(e: ControlError) -> backoff::Error<ControlError> {
    match e {
        ControlError::Unreachable { .. } => backoff::Error::transient(e),
        other => backoff::Error::permanent(other),
    }
}

#[async_trait::async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register_party(
        &self,
        party_id: &str,
        name: &str,
        host: &PeerIdentity,
        host_nat: &PeerNatInfo,
    ) -> Result<(), ControlError> {
        backoff::future::retry(Self::retry_policy(), || async {
            let body = RegisterBody {
                party_id,
                name,
                host: PeerDescriptor {
                    identity: host.clone(),
                    nat: *host_nat,
                },
            };
            let response = self.post_json("/parties", &body).await.map_err(transient)?;
            Self::expect_ok(response, || ControlError::Protocol {
                message: "registry rejected party registration".to_string(),
            })
            .await
            .map_err(transient)?;
            Ok(())
        })
        .await
    }

    async fn join_party(
        &self,
        party_id: &str,
        peer: &PeerIdentity,
        peer_nat: &PeerNatInfo,
    ) -> Result<PartyInfo, ControlError> {
        backoff::future::retry(Self::retry_policy(), || async {
            let body = JoinBody {
                peer: PeerDescriptor {
                    identity: peer.clone(),
                    nat: *peer_nat,
                },
            };
            let response = self
                .post_json(&format!("/parties/{party_id}/join"), &body)
                .await
                .map_err(transient)?;
            let response = Self::expect_ok(response, || ControlError::PartyNotFound {
                party_id: party_id.to_string(),
            })
            .await
            .map_err(transient)?;
            response
                .json::<PartyInfo>()
                .await
                .map_err(|e| backoff::Error::permanent(ControlError::Http(e)))
        })
        .await
    }

    async fn leave_party(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError> {
        let response = self
            .post_json(&format!("/parties/{party_id}/leave"), &LeaveBody { peer_id })
            .await?;
        Self::expect_ok(response, || ControlError::PartyNotFound {
            party_id: party_id.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn update_peer(
        &self,
        party_id: &str,
        peer: &PeerIdentity,
        peer_nat: &PeerNatInfo,
    ) -> Result<(), ControlError> {
        let body = JoinBody {
            peer: PeerDescriptor {
                identity: peer.clone(),
                nat: *peer_nat,
            },
        };
        let response = self
            .client
            .put(format!(
                "{}/parties/{party_id}/peers/{}",
                self.base, peer.peer_id
            ))
            .json(&body)
            .send()
            .await
            .map_err(unreachable)?;
        Self::expect_ok(response, || ControlError::PeerNotFound {
            peer_id: peer.peer_id.clone(),
        })
        .await?;
        Ok(())
    }

    async fn get_party(&self, party_id: &str) -> Result<Option<PartyInfo>, ControlError> {
        let response = self
            .client
            .get(format!("{}/parties/{party_id}", self.base))
            .send()
            .await
            .map_err(unreachable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_ok(response, || ControlError::PartyNotFound {
            party_id: party_id.to_string(),
        })
        .await?;
        Ok(Some(response.json().await?))
    }

    async fn discover_peer(
        &self,
        party_id: &str,
        peer_id: &str,
    ) -> Result<Option<PeerDescriptor>, ControlError> {
        let response = self
            .client
            .get(format!("{}/parties/{party_id}/peers/{peer_id}", self.base))
            .send()
            .await
            .map_err(unreachable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_ok(response, || ControlError::PeerNotFound {
            peer_id: peer_id.to_string(),
        })
        .await?;
        Ok(Some(response.json().await?))
    }

    async fn heartbeat(&self, party_id: &str, peer_id: &str) -> Result<(), ControlError> {
        let response = self
            .post_json(&format!("/parties/{party_id}/heartbeat"), &LeaveBody { peer_id })
            .await?;
        Self::expect_ok(response, || ControlError::PartyNotFound {
            party_id: party_id.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn list_relays(&self) -> Result<Vec<RelayInfo>, ControlError> {
        let response = self
            .client
            .get(format!("{}/relays", self.base))
            .send()
            .await
            .map_err(unreachable)?;
        let response = Self::expect_ok(response, || ControlError::Protocol {
            message: "relay directory missing".to_string(),
        })
        .await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Serve one canned response and shut down
    async fn serve_once(response: String) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
        addr
    }

    #[tokio::test]
    async fn test_get_party_parses_roster() {
        let body = r#"{
            "party_id": "party-1",
            "name": "lan night",
            "host_id": "host-1",
            "peers": [{
                "identity": {"peer_id": "host-1", "display_name": "alice", "public_key": "a2V5"},
                "nat": {"nat_type": "full_cone", "public_ip": "203.0.113.1", "public_port": 51820}
            }]
        }"#;
        let addr = serve_once(http_response("200 OK", body)).await;
        let control = HttpControlPlane::new(&format!("http://{addr}"));

        let party = control.get_party("party-1").await.unwrap().unwrap();
        assert_eq!(party.name, "lan night");
        assert_eq!(party.peers.len(), 1);
        assert_eq!(party.peers[0].nat.public_port, 51820);
    }

    #[tokio::test]
    async fn test_get_party_404_is_none() {
        let addr = serve_once(http_response("404 Not Found", "{}")).await;
        let control = HttpControlPlane::new(&format!("http://{addr}"));
        assert!(control.get_party("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_relays() {
        let body = r#"[{"public_ip": "198.51.100.4", "port": 51820, "region": "eu"}]"#;
        let addr = serve_once(http_response("200 OK", body)).await;
        let control = HttpControlPlane::new(&format!("http://{addr}"));

        let relays = control.list_relays().await.unwrap();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].endpoint().to_string(), "198.51.100.4:51820");
    }

    #[tokio::test]
    async fn test_unreachable_registry_maps_to_unreachable() {
        // bind-then-drop leaves a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let control = HttpControlPlane::new(&format!("http://{addr}"));
        let err = control.get_party("party-1").await.unwrap_err();
        assert!(matches!(err, ControlError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_protocol_error() {
        let addr = serve_once(http_response("500 Internal Server Error", "oops")).await;
        let control = HttpControlPlane::new(&format!("http://{addr}"));
        let err = control.list_relays().await.unwrap_err();
        assert!(matches!(err, ControlError::Protocol { .. }));
    }
}
