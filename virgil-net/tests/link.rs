mod common;

use std::time::Duration;

use virgil_types::{ChannelKey, LinkInfo, Message};

fn link_message() -> Message {
    Message::ChannelLink {
        sending_channel_index: Some(0),
        sending_channel_type: Some("tx".into()),
        channel_index: 0,
        channel_type: "rx".into(),
    }
}

#[test]
fn test_channel_link_subscribes_and_records_link() {
    let node = common::spawn_test_node("rackrx");
    let mut mic = common::RawPeer::connect("mic1", &node.addr);

    mic.send(vec![link_message()]);
    let reply = mic.recv();
    match &reply[0] {
        Message::StatusUpdate {
            channel_index,
            channel_type,
            params,
        } => {
            assert_eq!((*channel_index, channel_type.as_str()), (0, "rx"));
            assert_eq!(params["linkedChannels"][0]["deviceName"], "mic1");
            assert_eq!(params["linkedChannels"][0]["channelIndex"], 0);
            assert_eq!(params["linkedChannels"][0]["channelType"], "tx");
        }
        other => panic!("Expected statusUpdate, got {other:?}"),
    }

    let key = ChannelKey::new(0, "rx");
    {
        let node = node.node.lock().unwrap();
        assert!(node.subscriptions().is_subscribed(&key, "mic1"));
        assert_eq!(
            node.channels().get(&key).unwrap().linked_channels,
            vec![LinkInfo::channel("mic1", 0, "tx")]
        );
    }

    // The node queued an info request for our sending channel; it comes
    // out after the bootstrap device info request.
    mic.send(vec![Message::EndResponse]);
    assert_eq!(mic.recv(), vec![Message::info_request(-1, None)]);
    mic.send(vec![Message::EndResponse]);
    assert_eq!(mic.recv(), vec![Message::info_request(0, Some("tx"))]);
}

#[test]
fn test_channel_unlink_reverses_link_state() {
    let node = common::spawn_test_node("rackrx");
    let mut mic = common::RawPeer::connect("mic1", &node.addr);

    mic.send(vec![link_message()]);
    mic.recv();

    mic.send(vec![Message::ChannelUnlink {
        sending_channel_index: Some(0),
        sending_channel_type: Some("tx".into()),
        channel_index: 0,
        channel_type: "rx".into(),
    }]);
    let reply = mic.recv();
    match &reply[0] {
        Message::StatusUpdate { params, .. } => {
            assert_eq!(params["linkedChannels"], serde_json::json!([]));
        }
        other => panic!("Expected statusUpdate, got {other:?}"),
    }

    let key = ChannelKey::new(0, "rx");
    let ok = common::wait_until(Duration::from_secs(1), || {
        let node = node.node.lock().unwrap();
        !node.subscriptions().is_subscribed(&key, "mic1")
            && node.channels().get(&key).unwrap().linked_channels.is_empty()
            && node.active_connections().is_empty()
    });
    assert!(ok, "link state should be fully reversed");
}
