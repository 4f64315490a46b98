use super::run_test;
use chrono::NaiveDate;
use clinic_notifier::scheduler::DigestKind;

#[test]
fn markers_are_claimed_once_per_date() {
    run_test(|mut connection| async move {
        let kind = DigestKind::Evening;
        let previous = connection.get_daily_marker(kind).await.unwrap();
        // Any date other than the stored one.
        let date = match previous {
            Some(d) => d.succ_opt().unwrap(),
            None => NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        };

        assert!(connection.claim_daily_marker(kind, date).await.unwrap());
        assert_eq!(connection.get_daily_marker(kind).await.unwrap(), Some(date));
        assert!(!connection.claim_daily_marker(kind, date).await.unwrap());

        let settings = connection.load_settings().await.unwrap();
        let stored = settings
            .iter()
            .find(|(key, _)| key == "daily_notification_last_evening")
            .map(|(_, value)| value.clone());
        assert_eq!(stored, Some(serde_json::json!(date.format("%Y-%m-%d").to_string())));

        connection
            .restore_daily_marker(kind, date, previous)
            .await
            .unwrap();
        assert_eq!(connection.get_daily_marker(kind).await.unwrap(), previous);
        assert!(connection.claim_daily_marker(kind, date).await.unwrap());
        connection
            .restore_daily_marker(kind, date, previous)
            .await
            .unwrap();
    });
}

#[test]
fn restore_leaves_a_newer_claim_alone() {
    run_test(|mut connection| async move {
        let kind = DigestKind::Morning;
        let previous = connection.get_daily_marker(kind).await.unwrap();
        let first = match previous {
            Some(d) => d.succ_opt().unwrap(),
            None => NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        };
        let second = first.succ_opt().unwrap();

        assert!(connection.claim_daily_marker(kind, first).await.unwrap());
        assert!(connection.claim_daily_marker(kind, second).await.unwrap());
        connection
            .restore_daily_marker(kind, first, previous)
            .await
            .unwrap();
        assert_eq!(connection.get_daily_marker(kind).await.unwrap(), Some(second));

        connection
            .restore_daily_marker(kind, second, previous)
            .await
            .unwrap();
        assert_eq!(connection.get_daily_marker(kind).await.unwrap(), previous);
    });
}
