use actix_cors::Cors;
use actix_web::{delete, get, post, put, web, App, HttpRequest, HttpResponse, HttpServer};
use bson::doc;
use chrono::{NaiveDate, Utc};
use futures::stream::TryStreamExt;
use mongodb::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod allocation;
mod auth;
mod directory;
mod error;
mod schemas;
mod split;
mod store;

use allocation::ShareEntry;
use auth::{AccountAccess, AccountAdmin, Identified};
use error::{ApiError, ApiResult};
use schemas::{Account, Membership, Payee, Role, User};
use split::SplitDraft;

#[derive(Deserialize)]
struct RegisterJson {
    name: String,
    email: String,
}

#[derive(Deserialize)]
struct AccountJson {
    name: String,
    description: Option<String>,
    currency: String,
}

#[derive(Deserialize)]
struct InviteJson {
    email: String,
    role: Role,
}

#[derive(Deserialize)]
struct RoleJson {
    role: Role,
}

#[derive(Deserialize)]
struct PayeeJson {
    name: String,
    membership_id: Option<String>,
}

#[derive(Deserialize)]
struct EntryJson {
    payee_id: String,
    factor: i64,
    extra: i64,
}

/// Event edit submission: the whole working copy in one request. Exactly one
/// of `saving` and `portion` carries the field the user last steered; the
/// other is derived server-side.
#[derive(Deserialize)]
struct EventJson {
    name: String,
    description: Option<String>,
    delivery: NaiveDate,
    income: i64,
    saving: Option<i64>,
    portion: Option<Decimal>,
    entries: Vec<EntryJson>,
}

/// Applies one submitted working copy to a draft: field edits, entry
/// add/replace/remove, and finally the steered field, which decides whether
/// saving or portion is derived.
fn apply_edits(draft: &mut SplitDraft, json: EventJson) -> ApiResult<()> {
    let mut seen = std::collections::HashSet::new();
    for entry in &json.entries {
        if !seen.insert(entry.payee_id.as_str()) {
            return Err(ApiError::BadRequest(format!(
                "payee {} appears twice in the entries",
                entry.payee_id
            )));
        }
    }
    draft.name = json.name;
    draft.description = json.description;
    draft.delivery = json.delivery;
    draft.set_income(json.income);
    let stale: Vec<String> = draft
        .entries
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    for payee_id in &stale {
        draft.remove_entry(payee_id);
    }
    for entry in &json.entries {
        draft.set_entry(
            &entry.payee_id,
            ShareEntry {
                factor: entry.factor,
                extra: entry.extra,
            },
        );
    }
    match (json.saving, json.portion) {
        (Some(saving), None) => draft.set_saving(Decimal::from(saving)),
        (None, Some(portion)) => draft.set_portion(portion),
        _ => {
            return Err(ApiError::BadRequest(
                "provide exactly one of saving or portion".to_string(),
            ))
        }
    }
    Ok(())
}

#[post("/users")]
async fn register_user(
    client: web::Data<Client>,
    request: HttpRequest,
    json: web::Json<RegisterJson>,
) -> ApiResult<HttpResponse> {
    let claims = auth::verify_identity(&request).ok_or(ApiError::Unauthenticated)?;
    let json = json.into_inner();
    if directory::user_by_external_id(&client, &claims.external_id)
        .await?
        .is_some()
        || directory::user_by_email(&client, &json.email).await?.is_some()
    {
        return Err(ApiError::Conflict("user is already registered".to_string()));
    }
    let user = User {
        id: Uuid::new_v4().to_string(),
        name: json.name,
        email: json.email,
        external_id: claims.external_id,
    };
    store::users(&client).insert_one(&user, None).await?;
    tracing::info!(user_id = %user.id, "user registered");
    Ok(HttpResponse::Ok().json(user))
}

#[get("/users/me")]
async fn current_user(identified: Identified) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(identified.user))
}

#[get("/users/me/memberships")]
async fn my_memberships(
    client: web::Data<Client>,
    identified: Identified,
) -> ApiResult<HttpResponse> {
    let memberships = directory::list_by_user(&client, &identified.user.id).await?;
    Ok(HttpResponse::Ok().json(memberships))
}

#[post("/accounts")]
async fn create_account(
    client: web::Data<Client>,
    identified: Identified,
    json: web::Json<AccountJson>,
) -> ApiResult<HttpResponse> {
    let json = json.into_inner();
    let now = Utc::now();
    let account = Account {
        id: Uuid::new_v4().to_string(),
        name: json.name,
        description: json.description,
        currency: json.currency.to_uppercase(),
    };
    // the creator becomes the first admin, in the same transaction so an
    // account can never exist without one
    let membership = Membership {
        id: Uuid::new_v4().to_string(),
        account_id: account.id.clone(),
        user_id: identified.user.id.clone(),
        role: Role::Admin,
        created_at: now,
        updated_at: now,
    };
    let mut session = client.start_session(None).await?;
    session.start_transaction(None).await?;
    let result: mongodb::error::Result<()> = async {
        store::accounts(&client)
            .insert_one_with_session(&account, None, &mut session)
            .await?;
        store::memberships(&client)
            .insert_one_with_session(&membership, None, &mut session)
            .await?;
        Ok(())
    }
    .await;
    store::commit_or_abort(session, result).await?;
    tracing::info!(account_id = %account.id, "account created");
    Ok(HttpResponse::Ok().json(account))
}

#[get("/accounts/{account_id}")]
async fn get_account(client: web::Data<Client>, access: AccountAccess) -> ApiResult<HttpResponse> {
    let account = store::accounts(&client)
        .find_one(doc! { "id": &access.account_id }, None)
        .await?
        .ok_or(ApiError::NotFound("account"))?;
    Ok(HttpResponse::Ok().json(account))
}

#[delete("/accounts/{account_id}")]
async fn delete_account(
    client: web::Data<Client>,
    admin: AccountAdmin,
) -> ApiResult<HttpResponse> {
    let account_id = admin.account_id;
    let mut session = client.start_session(None).await?;
    session.start_transaction(None).await?;
    let result: mongodb::error::Result<()> = async {
        store::payments(&client)
            .delete_many_with_session(doc! { "account_id": &account_id }, None, &mut session)
            .await?;
        store::events(&client)
            .delete_many_with_session(doc! { "account_id": &account_id }, None, &mut session)
            .await?;
        store::payees(&client)
            .delete_many_with_session(doc! { "account_id": &account_id }, None, &mut session)
            .await?;
        store::memberships(&client)
            .delete_many_with_session(doc! { "account_id": &account_id }, None, &mut session)
            .await?;
        store::accounts(&client)
            .delete_one_with_session(doc! { "id": &account_id }, None, &mut session)
            .await?;
        Ok(())
    }
    .await;
    store::commit_or_abort(session, result).await?;
    tracing::info!(%account_id, "account deleted");
    Ok(HttpResponse::Ok().body("account deleted"))
}

#[get("/accounts/{account_id}/access")]
async fn resolve_access(
    client: web::Data<Client>,
    identified: Identified,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let access = directory::resolve(&client, &identified.user.id, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "access": access })))
}

#[get("/accounts/{account_id}/members")]
async fn list_members(client: web::Data<Client>, access: AccountAccess) -> ApiResult<HttpResponse> {
    let members = directory::list_by_account(&client, &access.account_id).await?;
    Ok(HttpResponse::Ok().json(members))
}

#[post("/accounts/{account_id}/members")]
async fn invite_member(
    client: web::Data<Client>,
    admin: AccountAdmin,
    json: web::Json<InviteJson>,
) -> ApiResult<HttpResponse> {
    let membership = directory::invite(
        &client,
        &admin.user.id,
        &admin.account_id,
        &json.email,
        json.role,
    )
    .await?;
    Ok(HttpResponse::Ok().json(json!({ "membership_id": membership.id })))
}

#[put("/accounts/{account_id}/members/{membership_id}")]
async fn set_member_role(
    client: web::Data<Client>,
    admin: AccountAdmin,
    path: web::Path<(String, String)>,
    json: web::Json<RoleJson>,
) -> ApiResult<HttpResponse> {
    let (_, membership_id) = path.into_inner();
    directory::update_role(
        &client,
        &admin.user.id,
        &admin.account_id,
        &membership_id,
        json.role,
    )
    .await?;
    Ok(HttpResponse::Ok().body("role updated"))
}

#[delete("/accounts/{account_id}/members/{membership_id}")]
async fn remove_member(
    client: web::Data<Client>,
    admin: AccountAdmin,
    path: web::Path<(String, String)>,
) -> ApiResult<HttpResponse> {
    let (_, membership_id) = path.into_inner();
    directory::remove(&client, &admin.user.id, &admin.account_id, &membership_id).await?;
    Ok(HttpResponse::Ok().body("member removed"))
}

#[post("/accounts/{account_id}/leave")]
async fn leave_account(
    client: web::Data<Client>,
    access: AccountAccess,
) -> ApiResult<HttpResponse> {
    directory::leave(&client, &access.user.id, &access.account_id).await?;
    Ok(HttpResponse::Ok().body("left the account"))
}

#[post("/accounts/{account_id}/payees")]
async fn create_payee(
    client: web::Data<Client>,
    admin: AccountAdmin,
    json: web::Json<PayeeJson>,
) -> ApiResult<HttpResponse> {
    let json = json.into_inner();
    if let Some(membership_id) = &json.membership_id {
        store::memberships(&client)
            .find_one(
                doc! { "id": membership_id, "account_id": &admin.account_id },
                None,
            )
            .await?
            .ok_or(ApiError::NotFound("membership"))?;
        let taken = store::payees(&client)
            .find_one(
                doc! { "account_id": &admin.account_id, "membership_id": membership_id },
                None,
            )
            .await?
            .is_some();
        if taken {
            return Err(ApiError::Conflict(
                "this membership already has a payee".to_string(),
            ));
        }
    }
    let payee = Payee {
        id: Uuid::new_v4().to_string(),
        account_id: admin.account_id,
        name: json.name,
        membership_id: json.membership_id,
    };
    store::payees(&client).insert_one(&payee, None).await?;
    Ok(HttpResponse::Ok().json(payee))
}

#[get("/accounts/{account_id}/payees")]
async fn list_payees(client: web::Data<Client>, access: AccountAccess) -> ApiResult<HttpResponse> {
    let payees: Vec<Payee> = store::payees(&client)
        .find(doc! { "account_id": &access.account_id }, None)
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(payees))
}

#[post("/accounts/{account_id}/events")]
async fn create_event(
    client: web::Data<Client>,
    admin: AccountAdmin,
    json: web::Json<EventJson>,
) -> ApiResult<HttpResponse> {
    let json = json.into_inner();
    let mut draft = SplitDraft::new(
        json.name.clone(),
        json.description.clone(),
        json.delivery,
        json.income,
    );
    apply_edits(&mut draft, json)?;
    let event_id = split::commit_new(&client, &admin.account_id, &draft).await?;
    Ok(HttpResponse::Ok().json(json!({ "event_id": event_id })))
}

#[put("/accounts/{account_id}/events/{event_id}")]
async fn update_event(
    client: web::Data<Client>,
    admin: AccountAdmin,
    path: web::Path<(String, String)>,
    json: web::Json<EventJson>,
) -> ApiResult<HttpResponse> {
    let (_, event_id) = path.into_inner();
    let existing = store::events(&client)
        .find_one(
            doc! { "id": &event_id, "account_id": &admin.account_id },
            None,
        )
        .await?
        .ok_or(ApiError::NotFound("event"))?;
    let payments = split::payments_of(&client, &existing.id).await?;
    let mut draft = SplitDraft::from_event(&existing, &payments);
    apply_edits(&mut draft, json.into_inner())?;
    split::commit_update(&client, &admin.account_id, &existing, &draft).await?;
    Ok(HttpResponse::Ok().body("event updated"))
}

#[get("/accounts/{account_id}/events/{event_id}")]
async fn get_event(
    client: web::Data<Client>,
    access: AccountAccess,
    path: web::Path<(String, String)>,
) -> ApiResult<HttpResponse> {
    let (_, event_id) = path.into_inner();
    let event = store::events(&client)
        .find_one(
            doc! { "id": &event_id, "account_id": &access.account_id },
            None,
        )
        .await?
        .ok_or(ApiError::NotFound("event"))?;
    let payments = split::payments_of(&client, &event.id).await?;
    Ok(HttpResponse::Ok().json(split::event_view(event, &payments)))
}

#[get("/accounts/{account_id}/events/{event_id}/payments")]
async fn list_event_payments(
    client: web::Data<Client>,
    access: AccountAccess,
    path: web::Path<(String, String)>,
) -> ApiResult<HttpResponse> {
    let (_, event_id) = path.into_inner();
    let event = store::events(&client)
        .find_one(
            doc! { "id": &event_id, "account_id": &access.account_id },
            None,
        )
        .await?
        .ok_or(ApiError::NotFound("event"))?;
    let payments = split::payments_of(&client, &event.id).await?;
    Ok(HttpResponse::Ok().json(split::payment_views(&event, payments)))
}

#[delete("/accounts/{account_id}/events/{event_id}")]
async fn delete_event(
    client: web::Data<Client>,
    admin: AccountAdmin,
    path: web::Path<(String, String)>,
) -> ApiResult<HttpResponse> {
    let (_, event_id) = path.into_inner();
    split::delete_split(&client, &admin.account_id, &event_id).await?;
    Ok(HttpResponse::Ok().body("event deleted"))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let uri = std::env::var("MONGODB_URI").expect("You need to add the MONGODB_URI to the env");
    std::env::var("IDENTITY_SECRET").expect("You need to add the IDENTITY_SECRET to the env");
    let bind = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let client = Client::with_uri_str(uri).await.expect("failed to connect");
    store::ensure_indexes(&client)
        .await
        .expect("failed to create the store indexes");
    tracing::info!(%bind, "connected, serving");

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(web::Data::new(client.clone()))
            .service(register_user)
            .service(current_user)
            .service(my_memberships)
            .service(create_account)
            .service(get_account)
            .service(delete_account)
            .service(resolve_access)
            .service(list_members)
            .service(invite_member)
            .service(set_member_role)
            .service(remove_member)
            .service(leave_account)
            .service(create_payee)
            .service(list_payees)
            .service(create_event)
            .service(update_event)
            .service(get_event)
            .service(list_event_payments)
            .service(delete_event)
    })
    .bind(bind)?
    .run()
    .await
}
