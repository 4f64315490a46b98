use super::run_test;
use clinic_notifier::db::subscriptions::NewPushSubscription;
use uuid::Uuid;

fn new_subscription(user_id: Uuid, endpoint: &str) -> NewPushSubscription {
    NewPushSubscription {
        user_id,
        endpoint: endpoint.to_string(),
        p256dh: "BNcRdreALRFXTkOOUHK1EtK2wtaz5Ry4YfYCA_0QTpQtUbVlUls0VJXg7A8u-Ts1XbjhazAkj7I99e8QcYP7DkM".to_string(),
        auth: "tBHItJI5svbpez7KI4CCXg".to_string(),
        user_agent: Some("Mozilla/5.0".to_string()),
    }
}

fn unique_endpoint() -> String {
    format!("https://fcm.googleapis.com/fcm/send/{}", Uuid::new_v4())
}

#[test]
fn upsert_keeps_one_row_per_endpoint() {
    run_test(|mut connection| async move {
        let first_user = Uuid::new_v4();
        let second_user = Uuid::new_v4();
        let endpoint = unique_endpoint();

        let created = connection
            .upsert_push_subscription(&new_subscription(first_user, &endpoint))
            .await
            .unwrap();
        assert!(created.active);
        assert_eq!(created.user_id, first_user);

        // The same browser signing in as someone else moves the subscription.
        let moved = connection
            .upsert_push_subscription(&new_subscription(second_user, &endpoint))
            .await
            .unwrap();
        assert_eq!(moved.id, created.id);
        assert_eq!(moved.user_id, second_user);

        let first = connection
            .active_push_subscriptions(&[first_user])
            .await
            .unwrap();
        assert!(first.is_empty());
        let second = connection
            .active_push_subscriptions(&[second_user])
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].endpoint, endpoint);
    });
}

#[test]
fn deactivated_subscriptions_are_skipped_until_resubscribed() {
    run_test(|mut connection| async move {
        let user_id = Uuid::new_v4();
        let endpoint = unique_endpoint();
        let sub = connection
            .upsert_push_subscription(&new_subscription(user_id, &endpoint))
            .await
            .unwrap();

        connection.deactivate_push_subscription(sub.id).await.unwrap();
        assert!(
            connection
                .active_push_subscriptions(&[user_id])
                .await
                .unwrap()
                .is_empty()
        );

        let again = connection
            .upsert_push_subscription(&new_subscription(user_id, &endpoint))
            .await
            .unwrap();
        assert_eq!(again.id, sub.id);
        assert!(again.active);
        assert_eq!(
            connection
                .active_push_subscriptions(&[user_id])
                .await
                .unwrap()
                .len(),
            1
        );
    });
}

#[test]
fn delete_only_removes_the_owners_subscription() {
    run_test(|mut connection| async move {
        let owner = Uuid::new_v4();
        let endpoint = unique_endpoint();
        connection
            .upsert_push_subscription(&new_subscription(owner, &endpoint))
            .await
            .unwrap();

        assert!(
            !connection
                .delete_push_subscription(Uuid::new_v4(), &endpoint)
                .await
                .unwrap()
        );
        assert!(
            connection
                .delete_push_subscription(owner, &endpoint)
                .await
                .unwrap()
        );
        assert!(
            !connection
                .delete_push_subscription(owner, &endpoint)
                .await
                .unwrap()
        );
    });
}
