use tracing::{debug, info};

use crate::command::{exec, exec_ignore_errors};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::id::ObjectId;

/// Container subnet; the host bridge holds `.1`.
pub const SUBNET_PREFIX: &str = "10.0.0";
pub const GATEWAY: &str = "10.0.0.1";
pub const PREFIX_LEN: u8 = 24;

/// Locally-administered OUI shared by every container interface.
const MAC_OUI: &str = "02:42:ac:11";

/// Host-side veth name, e.g. `veth0_ps_042`. Fits IFNAMSIZ.
pub fn host_veth(id: &ObjectId) -> String {
    format!("veth0_{id}")
}

/// Container-side veth name, e.g. `veth1_ps_042`.
pub fn peer_veth(id: &ObjectId) -> String {
    format!("veth1_{id}")
}

/// Named network namespace keyed by the container ID.
pub fn netns_name(id: &ObjectId) -> String {
    format!("netns_{id}")
}

/// Container address derived from the ID body with its `0` characters
/// removed: `ps_042` holds `10.0.0.42`, `ps_100` holds `10.0.0.1`.
///
/// The transform is lossy (`ps_204` and `ps_240` collide) but deployed
/// hosts pre-compute routes against it, so it is replicated exactly.
pub fn ip_for(id: &ObjectId) -> String {
    let octet: String = id.body().chars().filter(|c| *c != '0').collect();
    format!("{SUBNET_PREFIX}.{octet}")
}

/// MAC derived from the ID digits `d1 d2 d3`: `02:42:ac:11:0<d1>:<d2><d3>`.
/// Injective over the pool, unlike the IP transform.
pub fn mac_for(id: &ObjectId) -> String {
    let num = id.num();
    let d1 = num / 100;
    let d2 = num / 10 % 10;
    let d3 = num % 10;
    format!("{MAC_OUI}:0{d1}:{d2}{d3}")
}

/// Verify the configured bridge exists before any mutation.
pub async fn ensure_bridge(config: &EngineConfig) -> Result<()> {
    exec("ip", &["link", "show", &config.bridge])
        .await
        .map_err(|_| {
            EngineError::Precondition(format!("bridge {} does not exist", config.bridge))
        })?;
    Ok(())
}

/// Build the container's network fabric: a veth pair bridged on the host
/// side, with the peer addressed inside a fresh named namespace.
///
/// On failure the partially-built state is torn down before the error
/// surfaces.
pub async fn setup(config: &EngineConfig, id: &ObjectId) -> Result<()> {
    ensure_bridge(config).await?;

    let result = setup_inner(config, id).await;
    if result.is_err() {
        teardown(id).await;
    }
    result
}

async fn setup_inner(config: &EngineConfig, id: &ObjectId) -> Result<()> {
    let host = host_veth(id);
    let peer = peer_veth(id);
    let netns = netns_name(id);
    let ip = ip_for(id);
    let mac = mac_for(id);
    let addr = format!("{ip}/{PREFIX_LEN}");

    debug!(%id, %ip, %mac, "building network fabric");

    exec(
        "ip",
        &["link", "add", &host, "type", "veth", "peer", "name", &peer],
    )
    .await?;
    exec("ip", &["link", "set", &host, "up"]).await?;
    exec("ip", &["link", "set", &host, "master", &config.bridge]).await?;

    exec("ip", &["netns", "add", &netns]).await?;
    exec("ip", &["link", "set", &peer, "netns", &netns]).await?;

    exec(
        "ip",
        &["netns", "exec", &netns, "ip", "link", "set", "dev", "lo", "up"],
    )
    .await?;
    exec(
        "ip",
        &[
            "netns", "exec", &netns, "ip", "link", "set", "dev", &peer, "address", &mac,
        ],
    )
    .await?;
    exec(
        "ip",
        &[
            "netns", "exec", &netns, "ip", "addr", "add", &addr, "dev", &peer,
        ],
    )
    .await?;
    exec(
        "ip",
        &["netns", "exec", &netns, "ip", "link", "set", "dev", &peer, "up"],
    )
    .await?;
    exec(
        "ip",
        &[
            "netns", "exec", &netns, "ip", "route", "add", "default", "via", GATEWAY,
        ],
    )
    .await?;

    info!(%id, ip = %addr, "network fabric ready");
    Ok(())
}

/// Tear down the container's veth pair and named namespace.
///
/// Deleting the host end removes the peer with it. Best-effort and
/// idempotent: run after normal exit, on setup failure, and from `rm`
/// recovery after an engine crash.
pub async fn teardown(id: &ObjectId) {
    let host = host_veth(id);
    let netns = netns_name(id);
    exec_ignore_errors("ip", &["link", "del", &host]).await;
    exec_ignore_errors("ip", &["netns", "del", &netns]).await;
    debug!(%id, "network fabric removed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{POOL_MAX, POOL_MIN};

    fn id(s: &str) -> ObjectId {
        ObjectId::parse(s).unwrap()
    }

    #[test]
    fn ip_strips_zero_characters() {
        assert_eq!(ip_for(&id("ps_042")), "10.0.0.42");
        assert_eq!(ip_for(&id("ps_100")), "10.0.0.1");
        assert_eq!(ip_for(&id("ps_204")), "10.0.0.24");
        assert_eq!(ip_for(&id("ps_250")), "10.0.0.25");
        assert_eq!(ip_for(&id("ps_254")), "10.0.0.254");
    }

    #[test]
    fn ip_derivation_is_lossy() {
        // Deployed hosts rely on this exact transform even though distinct
        // IDs can share an address.
        assert_eq!(ip_for(&id("ps_204")), ip_for(&id("ps_240")));
    }

    #[test]
    fn mac_encodes_the_id_digits() {
        assert_eq!(mac_for(&id("ps_042")), "02:42:ac:11:00:42");
        assert_eq!(mac_for(&id("ps_100")), "02:42:ac:11:01:00");
        assert_eq!(mac_for(&id("ps_254")), "02:42:ac:11:02:54");
    }

    #[test]
    fn macs_are_unique_across_the_pool() {
        let mut seen = std::collections::HashSet::new();
        for num in POOL_MIN..=POOL_MAX {
            let mac = mac_for(&id(&format!("ps_{num:03}")));
            assert!(seen.insert(mac.clone()), "duplicate mac: {mac}");
        }
    }

    #[test]
    fn macs_are_well_formed() {
        for num in [POOL_MIN, 100, 199, POOL_MAX] {
            let mac = mac_for(&id(&format!("ps_{num:03}")));
            let octets: Vec<&str> = mac.split(':').collect();
            assert_eq!(octets.len(), 6, "bad mac: {mac}");
            for octet in octets {
                assert_eq!(octet.len(), 2, "bad octet in {mac}");
                assert!(u8::from_str_radix(octet, 16).is_ok(), "bad octet in {mac}");
            }
        }
    }

    #[test]
    fn interface_names_fit_ifnamsiz() {
        // IFNAMSIZ is 16 including the NUL terminator.
        for num in [POOL_MIN, POOL_MAX] {
            let cid = id(&format!("ps_{num:03}"));
            assert!(host_veth(&cid).len() <= 15);
            assert!(peer_veth(&cid).len() <= 15);
        }
    }

    #[test]
    fn names_are_keyed_by_id() {
        let cid = id("ps_042");
        assert_eq!(host_veth(&cid), "veth0_ps_042");
        assert_eq!(peer_veth(&cid), "veth1_ps_042");
        assert_eq!(netns_name(&cid), "netns_ps_042");
    }
}
