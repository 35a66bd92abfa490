//! ICMP reachability probing
//!
//! One shared `surge_ping::Client` serves every probe; concurrent pings
//! to distinct targets multiplex over it. Probe failure is not an error
//! anywhere in this system, so an unavailable ICMP socket (no raw-socket
//! privilege) degrades to "no measurement" rather than failing startup.

use std::net::IpAddr;
use std::time::Duration;

use surge_ping::{Client, Config, PingIdentifier, PingSequence};

/// ICMP echo prober
pub struct IcmpProbe {
    client: Option<Client>,
}

impl IcmpProbe {
    pub fn new() -> Self {
        let client = match Client::new(&Config::default()) {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "ICMP socket unavailable, latency probing disabled");
                None
            }
        };
        IcmpProbe { client }
    }

    /// One echo round trip, or `None` on timeout, error, or no ICMP socket
    pub async fn rtt(&self, target: IpAddr, timeout: Duration) -> Option<Duration> {
        let client = self.client.as_ref()?;
        let mut pinger = client.pinger(target, PingIdentifier(rand::random())).await;
        pinger.timeout(timeout);
        match pinger.ping(PingSequence(0), &[0u8; 32]).await {
            Ok((_, rtt)) => Some(rtt),
            Err(e) => {
                tracing::trace!(%target, error = %e, "Echo probe failed");
                None
            }
        }
    }
}

impl Default for IcmpProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Median of the successful samples, `None` when every sample failed
pub fn median(samples: &mut Vec<Duration>) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    samples.sort();
    Some(samples[samples.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_of_odd_samples() {
        let mut samples = vec![
            Duration::from_millis(30),
            Duration::from_millis(10),
            Duration::from_millis(20),
        ];
        assert_eq!(median(&mut samples), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_median_of_empty_is_none() {
        assert_eq!(median(&mut Vec::new()), None);
    }

    #[test]
    fn test_median_of_single_sample() {
        let mut samples = vec![Duration::from_millis(7)];
        assert_eq!(median(&mut samples), Some(Duration::from_millis(7)));
    }
}
