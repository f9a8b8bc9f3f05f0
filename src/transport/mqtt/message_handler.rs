//! Pure routing of MQTT events into relay decisions
//!
//! The event-loop driver calls [`MessageHandler::route_mqtt_event`] for every
//! polled event and forwards only what the transport cares about.

use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Decide whether an inbound publish belongs to the relay
    pub fn should_process_message(
        topic: &str,
        retain: bool,
        input_filter: &str,
        skip_retained: bool,
    ) -> bool {
        if retain && skip_retained {
            debug!("Ignoring retained message on topic: {}", topic);
            return false;
        }

        let filter = crate::message::delivery_filter(input_filter);
        if !crate::message::topic_matches(filter, topic) {
            debug!("Topic mismatch: expected {}, got {}", input_filter, topic);
            return false;
        }

        true
    }

    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match &connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                    code => EventRoute::ConnectionRefused(format!("{code:?}")),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(disconnect) => EventRoute::Disconnected(format!(
                    "broker sent DISCONNECT ({:?})",
                    disconnect.reason_code
                )),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    result: Self::validate_subscription_success(&suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck
    pub fn validate_subscription_success(
        return_codes: &[SubscribeReasonCode],
    ) -> Result<(), String> {
        if return_codes.is_empty() {
            return Err("SubAck carried no return codes".to_string());
        }
        if return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
        {
            Ok(())
        } else {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    /// Broker answered CONNECT with a failure code
    ConnectionRefused(String),
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: bytes::Bytes,
        retain: bool,
    },
    /// Session ended, by the broker or the network
    Disconnected(String),
    /// SubAck for a subscribe request
    SubscriptionConfirmed {
        packet_id: u16,
        result: Result<(), String>,
    },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, Disconnect, DisconnectReasonCode, Publish, SubAck};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_should_process_message() {
        let input = "pipeline/default_input";

        assert!(MessageHandler::should_process_message(input, false, input, false));

        // Retained messages are relayed unless explicitly skipped
        assert!(MessageHandler::should_process_message(input, true, input, false));
        assert!(!MessageHandler::should_process_message(input, true, input, true));

        assert!(!MessageHandler::should_process_message(
            "pipeline/other",
            false,
            input,
            false
        ));
    }

    #[test]
    fn test_should_process_message_with_filter() {
        assert!(MessageHandler::should_process_message(
            "sensors/kitchen",
            false,
            "sensors/+",
            false
        ));
        assert!(!MessageHandler::should_process_message(
            "sensors/kitchen/temp",
            false,
            "sensors/+",
            false
        ));
    }

    #[test]
    fn test_should_process_message_for_shared_subscription() {
        let shared = "$share/relays/pipeline/default_input";
        assert!(MessageHandler::should_process_message(
            "pipeline/default_input",
            false,
            shared,
            false
        ));
        assert!(!MessageHandler::should_process_message(
            "pipeline/other",
            false,
            shared,
            false
        ));
    }

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let refused = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionRefused(_)
        ));
    }

    #[test]
    fn test_route_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        match MessageHandler::route_mqtt_event(&disconnect) {
            EventRoute::Disconnected(reason) => assert!(reason.contains("NormalDisconnection")),
            other => panic!("Expected Disconnected route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("pipeline/default_input"),
            pkid: 1,
            payload: Bytes::from("hello"),
            properties: None,
        }));

        if let EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } = MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "pipeline/default_input");
            assert_eq!(payload, Bytes::from("hello"));
            assert!(retain);
        } else {
            panic!("Expected MessageReceived route");
        }
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 7,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
            properties: None,
        }));
        match MessageHandler::route_mqtt_event(&suback) {
            EventRoute::SubscriptionConfirmed { packet_id, result } => {
                assert_eq!(packet_id, 7);
                assert!(result.is_ok());
            }
            other => panic!("Expected SubscriptionConfirmed route, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[
            SubscribeReasonCode::Success(QoS::AtMostOnce),
            SubscribeReasonCode::Success(QoS::AtLeastOnce),
        ])
        .is_ok());

        assert!(
            MessageHandler::validate_subscription_success(&[SubscribeReasonCode::NotAuthorized])
                .is_err()
        );

        assert!(MessageHandler::validate_subscription_success(&[
            SubscribeReasonCode::Success(QoS::AtLeastOnce),
            SubscribeReasonCode::TopicFilterInvalid,
        ])
        .is_err());

        assert!(MessageHandler::validate_subscription_success(&[]).is_err());
    }
}
