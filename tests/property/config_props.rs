//! Property tests for broker url parsing

use proptest::prelude::*;
use wagner_remote::mqtt::{BrokerConfig, Protocol};

fn host_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z][a-z0-9]{0,10}",
        "[a-z][a-z0-9]{0,5}\\.[a-z]{2,4}",
        (1u8..=254, 0u8..=255, 0u8..=255, 1u8..=254)
            .prop_map(|(a, b, c, d)| format!("{}.{}.{}.{}", a, b, c, d)),
        Just("localhost".to_string()),
    ]
}

fn scheme_strategy() -> impl Strategy<Value = (&'static str, Protocol)> {
    prop_oneof![
        Just(("mqtt", Protocol::Mqtt)),
        Just(("tcp", Protocol::Mqtt)),
        Just(("mqtts", Protocol::Mqtts)),
        Just(("ssl", Protocol::Mqtts)),
        Just(("ws", Protocol::Ws)),
        Just(("wss", Protocol::Wss)),
    ]
}

proptest! {
    #[test]
    fn prop_from_url_keeps_host_port_and_protocol(
        host in host_strategy(),
        port in 1u16..=65535,
        (scheme, protocol) in scheme_strategy(),
    ) {
        let url = format!("{}://{}:{}", scheme, host, port);
        let config = BrokerConfig::from_url(&url).unwrap();
        prop_assert_eq!(&config.host, &host);
        prop_assert_eq!(config.protocol, protocol);
        // explicit default ports are dropped by the url parser
        prop_assert!(config.port == port || port == protocol.default_port());
        prop_assert!(config.clone().validate().is_ok());
    }

    #[test]
    fn prop_default_port_when_missing(
        host in host_strategy(),
        (scheme, protocol) in scheme_strategy(),
    ) {
        let config = BrokerConfig::from_url(&format!("{}://{}", scheme, host)).unwrap();
        prop_assert_eq!(config.port, protocol.default_port());
    }

    #[test]
    fn prop_validate_fills_client_id(host in host_strategy()) {
        let config = BrokerConfig {
            client_id: String::new(),
            ..BrokerConfig::from_url(&format!("mqtt://{}", host)).unwrap()
        };
        let validated = config.validate().unwrap();
        prop_assert!(validated.client_id.starts_with("Wagner-"));
    }
}
