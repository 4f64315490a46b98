use crate::db::Connection;
use crate::db::directory::Role;
use serde::Deserialize;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Who a notification is addressed to. All three forms may be combined.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct Targeting {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub user_ids: Vec<Uuid>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl Targeting {
    pub fn user(id: Uuid) -> Targeting {
        Targeting {
            user_id: Some(id),
            ..Targeting::default()
        }
    }

    pub fn roles(roles: &[Role]) -> Targeting {
        Targeting {
            roles: roles.to_vec(),
            ..Targeting::default()
        }
    }

    /// Also address `id`, if given.
    pub fn and_user(mut self, id: Option<Uuid>) -> Targeting {
        self.user_ids.extend(id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.user_ids.is_empty() && self.roles.is_empty()
    }
}

/// The union of explicitly named users and active holders of the roles.
///
/// Explicit ids are taken as given; role membership only counts active
/// users.
pub async fn resolve_recipients(
    conn: &mut dyn Connection,
    targeting: &Targeting,
) -> anyhow::Result<BTreeSet<Uuid>> {
    let mut recipients: BTreeSet<Uuid> = targeting
        .user_id
        .iter()
        .chain(&targeting.user_ids)
        .copied()
        .collect();
    if !targeting.roles.is_empty() {
        let users = conn.active_users_with_roles(&targeting.roles).await?;
        recipients.extend(users.into_iter().filter(|u| u.active).map(|u| u.id));
    }
    Ok(recipients)
}
