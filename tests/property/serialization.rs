//! Property tests for the wire decoders.
//!
//! 1. Arbitrary text never panics the client event decoder.
//! 2. Arbitrary bytes never panic the bus frame decoder.
//! 3. Any `message` event a client can build decodes back to the same request.
//! 4. Bus frames carrying arbitrary payloads survive the hub hop intact.

use parley_proto::bus::{self, BusFrame, Topic};
use parley_proto::event::{self, ClientEvent};
use parley_proto::message::{ListingId, Metadata, MessageType, SendMessage, UserId};
use proptest::prelude::*;

fn arb_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Text),
        Just(MessageType::Image),
        Just(MessageType::Location),
    ]
}

fn arb_send() -> impl Strategy<Value = SendMessage> {
    (
        "[a-z0-9]{1,12}",
        "[A-Za-z0-9_]{1,12}",
        ".{0,200}",
        arb_type(),
        prop::collection::btree_map("[a-z]{1,8}", ".{0,16}", 0..4),
    )
        .prop_map(|(receiver, listing, content, message_type, metadata)| SendMessage {
            receiver_id: UserId::new(receiver),
            listing_id: ListingId::new(listing),
            content,
            message_type,
            metadata: metadata.into_iter().collect::<Metadata>(),
        })
}

proptest! {
    #[test]
    fn client_decoder_never_panics(text in ".{0,512}") {
        let _ = event::decode_client(&text);
    }

    #[test]
    fn client_decoder_never_panics_on_event_shaped_json(
        name in "[a-zA-Z]{0,16}",
        data in ".{0,64}",
    ) {
        let text = format!(r#"{{"event":"{name}","data":{data}}}"#);
        let _ = event::decode_client(&text);
    }

    #[test]
    fn bus_decoder_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = bus::decode(&bytes);
    }

    #[test]
    fn message_event_survives_the_wire(request in arb_send()) {
        let sent = ClientEvent::Message(request);
        let text = event::encode_client(&sent).unwrap();
        prop_assert_eq!(event::decode_client(&text).unwrap(), sent);
    }

    #[test]
    fn publish_payload_is_opaque(
        topic in "user:[a-z0-9-]{1,24}",
        payload in prop::collection::vec(any::<u8>(), 0..1024),
    ) {
        let frame = BusFrame::Publish { topic: Topic::new(topic), payload };
        let bytes = bus::encode(&frame).unwrap();
        prop_assert_eq!(bus::decode(&bytes).unwrap(), frame);
    }
}
