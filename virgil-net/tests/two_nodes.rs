mod common;

use std::time::Duration;

use serde_json::json;
use virgil_types::ChannelKey;

/// Full exchange between two live nodes: beta discovers alpha, dials it,
/// walks the bootstrap (device info, channel info, channel link), and both
/// conversations wind down to idle.
#[test]
fn test_two_nodes_link_end_to_end() {
    let alpha = common::spawn_test_node("alpha");

    let beta_config = json!({
        "Name": "beta",
        "Model": "BP-1",
        "Type": "tx",
        "Channels": [
            {
                "channelIndex": 0,
                "channelType": "rx",
                "pad": {"dataType": "bool", "value": false, "readOnly": false}
            }
        ],
        "Connections": [
            {"name": "alpha", "selfIndex": 0, "selfType": "rx", "channelIndex": 0, "channelType": "tx"}
        ]
    });
    let beta = common::spawn_node_dialing(beta_config, alpha.port);

    // What discovery would do on peer-found.
    beta.registry.connect_peer("alpha", "127.0.0.1".parse().unwrap());

    let tx_key = ChannelKey::new(0, "tx");

    // Alpha ends up subscribed and linked.
    let linked = common::wait_until(Duration::from_secs(3), || {
        let alpha = alpha.node.lock().unwrap();
        alpha.subscriptions().is_subscribed(&tx_key, "beta")
            && alpha
                .channels()
                .get(&tx_key)
                .is_some_and(|c| !c.linked_channels.is_empty())
    });
    assert!(linked, "alpha should be subscribed and linked to beta");

    {
        let alpha_node = alpha.node.lock().unwrap();
        let links = &alpha_node.channels().get(&tx_key).unwrap().linked_channels;
        assert_eq!(links[0].device_name, "beta");
        assert_eq!(links[0].channel_index, Some(0));
        assert_eq!(links[0].channel_type.as_deref(), Some("rx"));
    }

    // Beta promoted its configured link to an active connection.
    let promoted = common::wait_until(Duration::from_secs(3), || {
        beta.node.lock().unwrap().active_connections().len() == 1
    });
    assert!(promoted, "beta should have promoted its known link");

    // Beta's mirror of alpha carries identity and the tx channel info.
    let mirrored = common::wait_until(Duration::from_secs(3), || {
        beta.registry.peer("alpha").is_some_and(|session| {
            let mirror = session.mirror();
            mirror.device_model.as_deref() == Some("RX-4")
                && mirror.channels.contains_key(&tx_key)
        })
    });
    assert!(mirrored, "beta should mirror alpha's identity and tx channel");
    let mirror = beta.registry.peer("alpha").unwrap().mirror();
    assert_eq!(mirror.virgil_version.as_deref(), Some("2.0.0"));
    assert_eq!(mirror.channels[&tx_key]["gain"]["dataType"], "number");

    // Alpha asked back about beta's sending channel after the link.
    let rx_key = ChannelKey::new(0, "rx");
    let back_filled = common::wait_until(Duration::from_secs(3), || {
        alpha.registry.peer("beta").is_some_and(|session| {
            let mirror = session.mirror();
            mirror.device_model.as_deref() == Some("BP-1")
                && mirror.channels.contains_key(&rx_key)
        })
    });
    assert!(back_filled, "alpha should mirror beta's rx channel");
}
