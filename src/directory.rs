use crate::error::{ApiError, ApiResult};
use crate::schemas::{Access, Membership, Role, User};
use crate::store;
use bson::doc;
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::Client;
use uuid::Uuid;

pub async fn user_by_email(client: &Client, email: &str) -> ApiResult<Option<User>> {
    Ok(store::users(client)
        .find_one(doc! { "email": email }, None)
        .await?)
}

pub async fn user_by_external_id(client: &Client, external_id: &str) -> ApiResult<Option<User>> {
    Ok(store::users(client)
        .find_one(doc! { "external_id": external_id }, None)
        .await?)
}

pub async fn lookup(
    client: &Client,
    account_id: &str,
    user_id: &str,
) -> ApiResult<Option<Membership>> {
    Ok(store::memberships(client)
        .find_one(doc! { "account_id": account_id, "user_id": user_id }, None)
        .await?)
}

pub async fn list_by_account(client: &Client, account_id: &str) -> ApiResult<Vec<Membership>> {
    Ok(store::memberships(client)
        .find(doc! { "account_id": account_id }, None)
        .await?
        .try_collect()
        .await?)
}

pub async fn list_by_user(client: &Client, user_id: &str) -> ApiResult<Vec<Membership>> {
    Ok(store::memberships(client)
        .find(doc! { "user_id": user_id }, None)
        .await?
        .try_collect()
        .await?)
}

/// Resolves what the caller may do with an account. Reads the membership row
/// on every call so a revocation takes effect on the very next request.
pub async fn resolve(client: &Client, caller_user_id: &str, account_id: &str) -> ApiResult<Access> {
    Ok(access_of(
        lookup(client, account_id, caller_user_id).await?.as_ref(),
    ))
}

fn access_of(membership: Option<&Membership>) -> Access {
    match membership.map(|m| m.role) {
        Some(Role::Admin) => Access::Admin,
        Some(Role::Viewer) => Access::Viewer,
        None => Access::Denied,
    }
}

/// Members may not touch their own membership through this path.
fn reject_self_action(actor_user_id: &str, target: &Membership) -> Result<(), ApiError> {
    if actor_user_id == target.user_id {
        return Err(ApiError::Conflict(
            "members cannot change or remove their own membership".to_string(),
        ));
    }
    Ok(())
}

/// An account keeps at least one admin at all times.
fn reject_last_admin(target: &Membership, admin_count: u64) -> Result<(), ApiError> {
    if target.role == Role::Admin && admin_count <= 1 {
        return Err(ApiError::Conflict(
            "an account must keep at least one admin".to_string(),
        ));
    }
    Ok(())
}

async fn membership_by_id(
    client: &Client,
    account_id: &str,
    membership_id: &str,
) -> ApiResult<Membership> {
    store::memberships(client)
        .find_one(doc! { "id": membership_id, "account_id": account_id }, None)
        .await?
        .ok_or(ApiError::NotFound("membership"))
}

async fn admin_count(client: &Client, account_id: &str) -> ApiResult<u64> {
    Ok(store::memberships(client)
        .count_documents(
            doc! { "account_id": account_id, "role": Role::Admin.as_str() },
            None,
        )
        .await?)
}

/// Adds a registered user to an account by email.
pub async fn invite(
    client: &Client,
    actor_user_id: &str,
    account_id: &str,
    email: &str,
    role: Role,
) -> ApiResult<Membership> {
    let invitee = user_by_email(client, email)
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    if invitee.id == actor_user_id {
        return Err(ApiError::Conflict(
            "you already belong to this account".to_string(),
        ));
    }
    if lookup(client, account_id, &invitee.id).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "{} is already a member of this account",
            invitee.email
        )));
    }
    let now = Utc::now();
    let membership = Membership {
        id: Uuid::new_v4().to_string(),
        account_id: account_id.to_string(),
        user_id: invitee.id,
        role,
        created_at: now,
        updated_at: now,
    };
    store::memberships(client)
        .insert_one(&membership, None)
        .await?;
    tracing::info!(account_id, membership_id = %membership.id, %role, "member invited");
    Ok(membership)
}

pub async fn update_role(
    client: &Client,
    actor_user_id: &str,
    account_id: &str,
    membership_id: &str,
    role: Role,
) -> ApiResult<()> {
    let mut target = membership_by_id(client, account_id, membership_id).await?;
    reject_self_action(actor_user_id, &target)?;
    if target.role == role {
        return Ok(());
    }
    if target.role == Role::Admin {
        reject_last_admin(&target, admin_count(client, account_id).await?)?;
    }
    target.role = role;
    target.updated_at = Utc::now();
    store::memberships(client)
        .replace_one(doc! { "id": membership_id }, &target, None)
        .await?;
    tracing::info!(account_id, membership_id, %role, "member role changed");
    Ok(())
}

/// A member walking away on their own. Unlike [`remove`] this path is meant
/// for the caller's own membership, so only the last-admin invariant
/// applies.
pub async fn leave(client: &Client, user_id: &str, account_id: &str) -> ApiResult<()> {
    let membership = lookup(client, account_id, user_id)
        .await?
        .ok_or(ApiError::NotFound("membership"))?;
    reject_last_admin(&membership, admin_count(client, account_id).await?)?;
    store::memberships(client)
        .delete_one(doc! { "id": &membership.id }, None)
        .await?;
    tracing::info!(account_id, membership_id = %membership.id, "member left");
    Ok(())
}

pub async fn remove(
    client: &Client,
    actor_user_id: &str,
    account_id: &str,
    membership_id: &str,
) -> ApiResult<()> {
    let target = membership_by_id(client, account_id, membership_id).await?;
    reject_self_action(actor_user_id, &target)?;
    reject_last_admin(&target, admin_count(client, account_id).await?)?;
    store::memberships(client)
        .delete_one(doc! { "id": membership_id }, None)
        .await?;
    tracing::info!(account_id, membership_id, "member removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership(user_id: &str, role: Role) -> Membership {
        let now = Utc::now();
        Membership {
            id: format!("m-{user_id}"),
            account_id: "acc-1".to_string(),
            user_id: user_id.to_string(),
            role,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn absent_membership_resolves_to_denied() {
        assert_eq!(access_of(None), Access::Denied);
    }

    #[test]
    fn roles_map_onto_their_access_levels() {
        let admin = membership("u-1", Role::Admin);
        let viewer = membership("u-2", Role::Viewer);
        assert_eq!(access_of(Some(&admin)), Access::Admin);
        assert_eq!(access_of(Some(&viewer)), Access::Viewer);
    }

    #[test]
    fn self_action_is_a_conflict() {
        let target = membership("u-1", Role::Admin);
        assert!(matches!(
            reject_self_action("u-1", &target),
            Err(ApiError::Conflict(_))
        ));
        assert!(reject_self_action("u-2", &target).is_ok());
    }

    #[test]
    fn sole_admin_cannot_be_taken_away() {
        let admin = membership("u-1", Role::Admin);
        assert!(matches!(
            reject_last_admin(&admin, 1),
            Err(ApiError::Conflict(_))
        ));
        // with a second admin in place the same removal goes through
        assert!(reject_last_admin(&admin, 2).is_ok());
    }

    #[test]
    fn viewer_removal_ignores_the_admin_count() {
        let viewer = membership("u-3", Role::Viewer);
        assert!(reject_last_admin(&viewer, 1).is_ok());
    }

    #[test]
    fn admin_may_leave_once_a_second_admin_is_in_place() {
        // account starts with admin A and viewer B; A alone cannot go
        let a = membership("u-a", Role::Admin);
        assert!(matches!(
            reject_last_admin(&a, 1),
            Err(ApiError::Conflict(_))
        ));
        // A invites C as a second admin, then A's own departure goes through
        assert!(reject_last_admin(&a, 2).is_ok());
    }
}
