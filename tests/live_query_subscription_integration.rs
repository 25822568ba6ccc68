
#[cfg(test)]
mod subscription_tests {
    use super::live_query_test_utils::shared::*;
    use futures_util::StreamExt;
    use parse_live_query::error::ParseError;
    use parse_live_query::live_query::{ConnectionStatus, Event, SubscriptionUpdate};
    use parse_live_query::{ParseDate, ParseObject, ParseQuery, RequestId};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn score_query(min_points: i64) -> ParseQuery {
        let mut query = ParseQuery::new("GameScore");
        query.greater_than("points", min_points);
        query
    }

    #[tokio::test]
    async fn test_resubscribe_after_disconnect() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let query = score_query(9);
        let subscription = harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        let confirmations = Arc::new(Mutex::new(Vec::new()));
        let record = confirmations.clone();
        subscription.handle_subscribe(move |_, is_new| record.lock().unwrap().push(is_new));

        let request_id = server.confirm_subscribe().await;
        eventually("the subscription is confirmed", || {
            harness.client.is_subscribed(&query)
        })
        .await;

        server.close(Some(1006), None);
        let mut replacement = harness.next_server().await;
        // Disconnecting leaves the confirmed subscription alone.
        assert!(harness.client.is_subscribed(&query));
        assert!(!harness.client.is_connected());

        replacement.accept(CLIENT_ID).await;
        let resubscribe = replacement.expect_json().await;
        assert_eq!(resubscribe["op"], "subscribe");
        assert_eq!(resubscribe["requestId"], json!(request_id));
        assert!(harness.client.is_pending_subscription(&query));
        assert!(!harness.client.is_subscribed(&query));

        replacement.push_json(subscribed(request_id));
        eventually("the subscription is confirmed again", || {
            harness.client.is_subscribed(&query)
        })
        .await;
        assert!(!harness.client.is_pending_subscription(&query));
        assert_eq!(*confirmations.lock().unwrap(), vec![true, true]);
    }

    #[tokio::test]
    async fn test_subscriptions_made_offline_are_sent_on_connect() {
        let mut harness = Harness::new();
        let first = harness.client.subscribe::<ParseObject>(score_query(1)).unwrap();
        let second = harness.client.subscribe::<ParseObject>(score_query(2)).unwrap();
        assert_eq!(harness.client.status(), ConnectionStatus::SocketNotEstablished);

        let mut server = harness.connect().await;
        assert_eq!(server.confirm_subscribe().await, 1);
        assert_eq!(server.confirm_subscribe().await, 2);

        eventually("both subscriptions are confirmed", || {
            harness.client.current_subscriptions().len() == 2
        })
        .await;
        assert_eq!(first.subscribed(), Some(true));
        assert_eq!(second.subscribed(), Some(true));
    }

    #[tokio::test]
    async fn test_unsubscribe_flow() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let query = score_query(9);
        let subscription = harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        let updates = subscription.updates();
        let request_id = server.confirm_subscribe().await;
        eventually("the subscription is confirmed", || {
            harness.client.is_subscribed(&query)
        })
        .await;

        harness.client.unsubscribe(&query).expect("unsubscribe");
        assert_eq!(
            server.expect_text().await,
            format!(r#"{{"op":"unsubscribe","requestId":{}}}"#, request_id)
        );
        // Still active until the server confirms.
        assert!(harness.client.is_subscribed(&query));
        assert!(matches!(
            harness.client.unsubscribe(&query),
            Err(ParseError::InvalidInput(_))
        ));

        server.push_json(unsubscribed(request_id));
        eventually("the unsubscription is confirmed", || {
            subscription.is_unsubscribed()
        })
        .await;
        assert!(!harness.client.is_subscribed(&query));
        assert!(harness.client.pending_subscriptions().is_empty());

        let updates: Vec<_> = updates.collect().await;
        assert_eq!(
            updates,
            vec![
                SubscriptionUpdate::Subscribed { is_new: true },
                SubscriptionUpdate::Unsubscribed
            ]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_requires_a_confirmed_subscription() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let query = score_query(9);
        assert!(matches!(
            harness.client.unsubscribe(&query),
            Err(ParseError::QueryNotSubscribed(_))
        ));

        let subscription = harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        server.expect_json().await;
        assert!(matches!(
            harness.client.unsubscribe_subscription(&subscription),
            Err(ParseError::QueryNotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_by_handle() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let query = score_query(9);
        let first = harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        let second = harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        server.confirm_subscribe().await;
        server.confirm_subscribe().await;
        eventually("both are confirmed", || {
            harness.client.current_subscriptions().len() == 2
        })
        .await;

        harness.client.unsubscribe_subscription(&second).unwrap();
        let unsubscribe = server.expect_json().await;
        assert_eq!(unsubscribe["requestId"], json!(second.request_id().value()));
        server.push_json(unsubscribed(second.request_id().value() as u64));

        eventually("the second one is gone", || second.is_unsubscribed()).await;
        assert_eq!(first.subscribed(), Some(true));
        assert!(harness.client.is_subscribed(&query));
    }

    #[tokio::test]
    async fn test_update_replaces_the_query() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let subscription = harness
            .client
            .subscribe::<ParseObject>(score_query(9))
            .unwrap();
        let request_id = server.confirm_subscribe().await;
        eventually("the subscription is confirmed", || {
            subscription.subscribed() == Some(true)
        })
        .await;

        let mut narrower = score_query(20);
        narrower.select(&["points"]);
        harness
            .client
            .update(&subscription, narrower.clone())
            .expect("update");
        assert_eq!(
            server.expect_text().await,
            format!(
                r#"{{"op":"update","query":{{"className":"GameScore","keys":["points"],"where":{{"points":{{"$gt":20}}}}}},"requestId":{},"sessionToken":"r:session-1"}}"#,
                request_id
            )
        );
        // The confirmed query stays in place until the update is acknowledged.
        assert!(harness.client.is_subscribed(&score_query(9)));
        assert!(harness.client.is_pending_subscription(&narrower));
        assert_eq!(subscription.query(), score_query(9));

        server.push_json(subscribed(request_id));
        eventually("the update is confirmed", || {
            harness.client.is_subscribed(&narrower)
        })
        .await;
        assert_eq!(subscription.subscribed(), Some(false));
        assert_eq!(subscription.query(), narrower);
        assert_eq!(subscription.request_id(), RequestId(request_id as u32));
    }

    #[tokio::test]
    async fn test_update_before_connecting_sends_the_latest_query() {
        let mut harness = Harness::new();
        let subscription = harness
            .client
            .subscribe::<ParseObject>(score_query(1))
            .unwrap();
        harness.client.update(&subscription, score_query(5)).unwrap();
        assert_eq!(harness.client.pending_subscriptions().len(), 1);

        let mut server = harness.connect().await;
        let subscribe = server.expect_json().await;
        assert_eq!(subscribe["op"], "subscribe");
        assert_eq!(subscribe["query"]["where"]["points"]["$gt"], 5);
        server.expect_silence().await;
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_the_confirmed_query() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let subscription = harness
            .client
            .subscribe::<ParseObject>(score_query(9))
            .unwrap();
        let request_id = server.confirm_subscribe().await;
        eventually("the subscription is confirmed", || {
            subscription.subscribed() == Some(true)
        })
        .await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        subscription.handle_event(move |query, _| {
            record.lock().unwrap().push(query.clone());
        });

        harness
            .client
            .update(&subscription, score_query(20))
            .expect("update");
        assert_eq!(server.expect_json().await["op"], "update");
        server.push_json(json!({
            "op": "error",
            "code": 102,
            "error": "bad query",
            "reconnect": false,
            "requestId": request_id
        }));
        eventually("the update is rejected", || subscription.error().is_some()).await;

        assert!(harness.client.is_subscribed(&score_query(9)));
        assert!(!harness.client.is_pending_subscription(&score_query(20)));
        assert_eq!(subscription.query(), score_query(9));
        assert!(harness.client.is_connected());

        server.push_json(event("create", request_id, json!({"objectId": "abc", "points": 11})));
        eventually("the event arrives", || !seen.lock().unwrap().is_empty()).await;
        assert_eq!(*seen.lock().unwrap(), vec![score_query(9)]);
    }

    #[tokio::test]
    async fn test_remove_pending_subscription() {
        let mut harness = Harness::new();
        let query = score_query(9);
        harness.client.subscribe::<ParseObject>(query.clone()).unwrap();

        assert!(harness.client.remove_pending_subscription(&query));
        assert!(!harness.client.remove_pending_subscription(&query));
        assert!(!harness.client.is_pending_subscription(&query));

        let mut server = harness.connect().await;
        server.expect_silence().await;
    }

    #[tokio::test]
    async fn test_error_with_request_id_stays_with_its_subscription() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let query = score_query(9);
        let subscription = harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        let request_id = server.expect_json().await["requestId"].as_u64().unwrap();
        server.push_json(json!({
            "op": "error",
            "code": 102,
            "error": "bad query",
            "reconnect": false,
            "requestId": request_id
        }));

        eventually("the subscription sees the error", || {
            subscription.error().is_some()
        })
        .await;
        assert!(matches!(subscription.error(), Some(ParseError::InvalidQuery(_))));
        assert!(!harness.client.is_pending_subscription(&query));
        assert!(harness.client.is_connected());
        assert!(!harness.client.is_disconnected_by_user());
    }

    #[tokio::test]
    async fn test_pending_unsubscribe_completes_on_reconnect() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let query = score_query(9);
        let subscription = harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        server.confirm_subscribe().await;
        eventually("the subscription is confirmed", || {
            harness.client.is_subscribed(&query)
        })
        .await;
        harness.client.unsubscribe(&query).unwrap();
        server.expect_json().await;

        server.close(None, None);
        let mut replacement = harness.next_server().await;
        replacement.accept(CLIENT_ID).await;

        eventually("the unsubscription completes", || {
            subscription.is_unsubscribed()
        })
        .await;
        replacement.expect_silence().await;
        assert!(harness.client.current_subscriptions().is_empty());
        assert!(harness.client.pending_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_close_keeps_subscriptions_and_shutdown_drops_them() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let query = score_query(9);
        harness.client.subscribe::<ParseObject>(query.clone()).unwrap();
        let request_id = server.confirm_subscribe().await;
        eventually("the subscription is confirmed", || {
            harness.client.is_subscribed(&query)
        })
        .await;

        harness.client.close().await;
        assert!(harness.client.is_subscribed(&query));

        let mut reopened = harness.connect().await;
        let resubscribe = reopened.expect_json().await;
        assert_eq!(resubscribe["requestId"], json!(request_id));

        harness.client.shutdown().await;
        assert!(harness.client.current_subscriptions().is_empty());
        assert!(harness.client.pending_subscriptions().is_empty());

        // Ids keep counting after a shutdown.
        let next = harness.client.subscribe::<ParseObject>(query).unwrap();
        assert_eq!(next.request_id(), RequestId(2));
    }

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct GameScore {
        object_id: String,
        points: i64,
        updated_at: Option<ParseDate>,
    }

    #[tokio::test]
    async fn test_typed_events_and_undecodable_payloads() {
        let mut harness = Harness::new();
        let mut server = harness.connect().await;

        let subscription = harness
            .client
            .subscribe::<GameScore>(score_query(9))
            .unwrap();
        let request_id = server.confirm_subscribe().await;

        server.push_json(event(
            "enter",
            request_id,
            json!({"objectId": "abc", "points": 11, "updatedAt": {"__type": "Date", "iso": "2024-05-01T10:00:00.000Z"}}),
        ));
        eventually("the enter event arrives", || subscription.event().is_some()).await;
        let entered = match subscription.event() {
            Some(Event::Entered(score)) => score,
            other => panic!("expected an enter event, got {:?}", other),
        };
        assert_eq!(entered.object_id, "abc");
        assert_eq!(entered.points, 11);
        let updated_at = entered.updated_at.expect("updatedAt").to_datetime().unwrap();
        assert_eq!(updated_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        server.push_json(event("delete", request_id, json!({"objectId": "abc"})));
        eventually("the bad payload is reported", || subscription.error().is_some()).await;
        assert!(matches!(
            subscription.error(),
            Some(ParseError::JsonDeserializationFailed(_))
        ));
        assert!(harness.client.is_connected());
    }
}
