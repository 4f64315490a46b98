use super::run_test;
use chrono::{TimeDelta, Utc};
use clinic_notifier::db::line_accounts::{LinkCode, LinkOutcome, PendingLink};
use uuid::Uuid;

fn unique_line_id() -> String {
    format!("U{}", Uuid::new_v4().simple())
}

fn unique_code() -> String {
    format!("LINK-{}", &Uuid::new_v4().simple().to_string()[..6].to_uppercase())
}

#[test]
fn codes_are_single_use() {
    run_test(|mut connection| async move {
        let user_id = Uuid::new_v4();
        let line_user_id = unique_line_id();
        let code = unique_code();
        let now = Utc::now();
        connection
            .record_pending_link(&PendingLink {
                line_user_id: line_user_id.clone(),
                display_name: Some("Khun Mali".to_string()),
                followed_at: now,
            })
            .await
            .unwrap();
        connection
            .insert_link_code(&LinkCode {
                code: code.clone(),
                user_id,
                expires_at: now + TimeDelta::minutes(10),
            })
            .await
            .unwrap();

        let outcome = connection
            .consume_link_code(&code, &line_user_id, Some("Khun Mali"), now)
            .await
            .unwrap();
        assert_eq!(outcome, LinkOutcome::Linked { user_id });

        let accounts = connection.line_accounts_for(&[user_id]).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].line_user_id, line_user_id);
        assert_eq!(accounts[0].display_name.as_deref(), Some("Khun Mali"));
        assert_eq!(connection.get_pending_link(&line_user_id).await.unwrap(), None);

        let again = connection
            .consume_link_code(&code, &unique_line_id(), None, now)
            .await
            .unwrap();
        assert_eq!(again, LinkOutcome::NotFound);
    });
}

#[test]
fn expired_codes_are_consumed_without_linking() {
    run_test(|mut connection| async move {
        let user_id = Uuid::new_v4();
        let code = unique_code();
        let now = Utc::now();
        connection
            .insert_link_code(&LinkCode {
                code: code.clone(),
                user_id,
                expires_at: now - TimeDelta::seconds(1),
            })
            .await
            .unwrap();

        let outcome = connection
            .consume_link_code(&code, &unique_line_id(), None, now)
            .await
            .unwrap();
        assert_eq!(outcome, LinkOutcome::Expired);
        assert!(connection.line_accounts_for(&[user_id]).await.unwrap().is_empty());

        let again = connection
            .consume_link_code(&code, &unique_line_id(), None, now)
            .await
            .unwrap();
        assert_eq!(again, LinkOutcome::NotFound);
    });
}

#[test]
fn a_new_code_replaces_the_previous_one() {
    run_test(|mut connection| async move {
        let user_id = Uuid::new_v4();
        let old = unique_code();
        let new = unique_code();
        let now = Utc::now();
        for code in [&old, &new] {
            connection
                .insert_link_code(&LinkCode {
                    code: code.clone(),
                    user_id,
                    expires_at: now + TimeDelta::minutes(10),
                })
                .await
                .unwrap();
        }

        let line_user_id = unique_line_id();
        assert_eq!(
            connection
                .consume_link_code(&old, &line_user_id, None, now)
                .await
                .unwrap(),
            LinkOutcome::NotFound
        );
        assert_eq!(
            connection
                .consume_link_code(&new, &line_user_id, None, now)
                .await
                .unwrap(),
            LinkOutcome::Linked { user_id }
        );
    });
}

#[test]
fn relinking_keeps_one_account_per_side() {
    run_test(|mut connection| async move {
        let first_user = Uuid::new_v4();
        let second_user = Uuid::new_v4();
        let line_user_id = unique_line_id();
        let now = Utc::now();

        for user_id in [first_user, second_user] {
            let code = unique_code();
            connection
                .insert_link_code(&LinkCode {
                    code: code.clone(),
                    user_id,
                    expires_at: now + TimeDelta::minutes(10),
                })
                .await
                .unwrap();
            connection
                .consume_link_code(&code, &line_user_id, None, now)
                .await
                .unwrap();
        }

        let accounts = connection
            .line_accounts_for(&[first_user, second_user])
            .await
            .unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].user_id, second_user);

        assert!(connection.unlink_line_account(second_user).await.unwrap());
        assert!(!connection.unlink_line_account(second_user).await.unwrap());
    });
}

#[test]
fn pending_links_can_be_removed() {
    run_test(|mut connection| async move {
        let line_user_id = unique_line_id();
        let link = PendingLink {
            line_user_id: line_user_id.clone(),
            display_name: None,
            followed_at: Utc::now(),
        };
        connection.record_pending_link(&link).await.unwrap();
        let stored = connection.get_pending_link(&line_user_id).await.unwrap();
        assert_eq!(stored.map(|l| l.line_user_id), Some(line_user_id.clone()));

        connection.remove_pending_link(&line_user_id).await.unwrap();
        assert_eq!(connection.get_pending_link(&line_user_id).await.unwrap(), None);
    });
}

#[test]
fn a_code_held_by_another_user_is_not_taken_over() {
    run_test(|mut connection| async move {
        let (owner, other) = (Uuid::new_v4(), Uuid::new_v4());
        let code = unique_code();
        let now = Utc::now();
        let link_code = |user_id| LinkCode {
            code: code.clone(),
            user_id,
            expires_at: now + TimeDelta::minutes(10),
        };
        assert!(connection.insert_link_code(&link_code(owner)).await.unwrap());
        assert!(!connection.insert_link_code(&link_code(other)).await.unwrap());
        // Reissuing the same code to its owner is not a collision.
        assert!(connection.insert_link_code(&link_code(owner)).await.unwrap());

        let line_user_id = unique_line_id();
        let outcome = connection
            .consume_link_code(&code, &line_user_id, None, now)
            .await
            .unwrap();
        assert_eq!(outcome, LinkOutcome::Linked { user_id: owner });
        assert!(connection.line_accounts_for(&[other]).await.unwrap().is_empty());
    });
}
