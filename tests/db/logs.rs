use super::run_test;
use clinic_notifier::db::notification_log::{
    DeliveryStatus, LogChannel, MAX_LOGGED_MESSAGE_CHARS, NewLogEntry,
};
use uuid::Uuid;

#[test]
fn logs_come_back_newest_first() {
    run_test(|mut connection| async move {
        let user_id = Uuid::new_v4();
        let title = format!("Materials ready {}", Uuid::new_v4());
        connection
            .record_notification(&NewLogEntry::new(
                Some(user_id),
                LogChannel::Push,
                "material_prepared",
                &title,
                "first",
                DeliveryStatus::Sent,
            ))
            .await
            .unwrap();
        connection
            .record_notification(
                &NewLogEntry::new(
                    Some(user_id),
                    LogChannel::Line,
                    "material_prepared",
                    &title,
                    "second",
                    DeliveryStatus::Failed,
                )
                .error("400 Bad Request")
                .metadata(serde_json::json!({ "http_status": 400 })),
            )
            .await
            .unwrap();

        let logs: Vec<_> = connection
            .get_notification_logs(500)
            .await
            .unwrap()
            .into_iter()
            .filter(|l| l.title == title)
            .collect();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "second");
        assert_eq!(logs[0].channel, LogChannel::Line);
        assert_eq!(logs[0].status, DeliveryStatus::Failed);
        assert_eq!(logs[0].error.as_deref(), Some("400 Bad Request"));
        assert_eq!(logs[0].metadata["http_status"], 400);
        assert_eq!(logs[1].message, "first");
        assert_eq!(logs[1].error, None);
    });
}

#[test]
fn log_limit_is_honored() {
    run_test(|mut connection| async move {
        for i in 0..3 {
            connection
                .record_notification(&NewLogEntry::new(
                    None,
                    LogChannel::System,
                    "daily_morning",
                    "Morning digest",
                    &format!("run {i}"),
                    DeliveryStatus::Sent,
                ))
                .await
                .unwrap();
        }
        assert_eq!(connection.get_notification_logs(2).await.unwrap().len(), 2);
    });
}

#[test]
fn long_messages_are_truncated() {
    run_test(|mut connection| async move {
        let title = format!("Long {}", Uuid::new_v4());
        let message = "ก".repeat(MAX_LOGGED_MESSAGE_CHARS * 2);
        connection
            .record_notification(&NewLogEntry::new(
                None,
                LogChannel::Push,
                "custom",
                &title,
                &message,
                DeliveryStatus::Sent,
            ))
            .await
            .unwrap();
        let logs = connection.get_notification_logs(500).await.unwrap();
        let entry = logs.iter().find(|l| l.title == title).unwrap();
        assert!(entry.message.chars().count() <= MAX_LOGGED_MESSAGE_CHARS);
    });
}
