use crate::error::ApiResult;
use crate::schemas::{Account, Event, Membership, Payee, Payment, User};
use bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, ClientSession, Collection, IndexModel};

const DB_NAME: &str = "SplitPool";

pub fn accounts(client: &Client) -> Collection<Account> {
    client.database(DB_NAME).collection("Accounts")
}

pub fn users(client: &Client) -> Collection<User> {
    client.database(DB_NAME).collection("Users")
}

pub fn memberships(client: &Client) -> Collection<Membership> {
    client.database(DB_NAME).collection("Memberships")
}

pub fn events(client: &Client) -> Collection<Event> {
    client.database(DB_NAME).collection("Events")
}

pub fn payees(client: &Client) -> Collection<Payee> {
    client.database(DB_NAME).collection("Payees")
}

pub fn payments(client: &Client) -> Collection<Payment> {
    client.database(DB_NAME).collection("Payments")
}

/// Unique indexes backing the uniqueness invariants: one user per email and
/// external id, one membership per (account, user).
pub async fn ensure_indexes(client: &Client) -> mongodb::error::Result<()> {
    let unique = |keys: bson::Document| {
        IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build()
    };
    users(client)
        .create_index(unique(doc! { "email": 1 }), None)
        .await?;
    users(client)
        .create_index(unique(doc! { "external_id": 1 }), None)
        .await?;
    memberships(client)
        .create_index(unique(doc! { "account_id": 1, "user_id": 1 }), None)
        .await?;
    Ok(())
}

/// Finishes a multi-document transaction: commits on success, aborts on any
/// write error so no partial state is observable. The original error is
/// surfaced to the caller either way.
pub async fn commit_or_abort(
    mut session: ClientSession,
    result: mongodb::error::Result<()>,
) -> ApiResult<()> {
    match result {
        Ok(()) => {
            session.commit_transaction().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(abort_err) = session.abort_transaction().await {
                tracing::warn!(error = %abort_err, "failed to abort transaction");
            }
            Err(err.into())
        }
    }
}
