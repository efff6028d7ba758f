//! Credential store: all reads and writes against the accounts and sessions
//! tables. Every mutation is a row-scoped upsert/update keyed by primary key,
//! so a retried refresh pass can replay a write without corrupting state.

use chrono::{DateTime, Utc};
use entity::account::{self, ProviderData, ProviderMetadata, RefreshState};
use entity::{session, user};
use inkauth_core::provider::{Provider, RefreshError, RefreshedCredential};
use inkauth_core::sealer::Sealer;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

/// Profile fields gathered at login/OAuth-callback time.
pub struct UserProfile<'a> {
    pub name: &'a str,
    pub username: &'a str,
    pub email: Option<&'a str>,
    pub avatar_url: Option<&'a str>,
}

/// Sealed credentials and metadata for an account upsert.
pub struct NewLogin {
    pub provider: Provider,
    pub provider_account_id: String,
    pub access_token_enc: String,
    pub refresh_token_enc: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: ProviderMetadata,
}

/// Resolve the local user for a provider identity, creating one on first
/// login: prefer the account link, then an email match (so linking a second
/// provider does not split the user), then insert.
pub async fn find_or_create_user(
    db: &DatabaseConnection,
    provider: Provider,
    provider_account_id: &str,
    profile: &UserProfile<'_>,
) -> Result<user::Model, DbErr> {
    if let Some(account) = account::Entity::find()
        .filter(account::Column::Provider.eq(provider.as_str()))
        .filter(account::Column::ProviderAccountId.eq(provider_account_id))
        .one(db)
        .await?
    {
        if let Some(existing) = user::Entity::find_by_id(&account.user_id).one(db).await? {
            return Ok(existing);
        }
    }

    if let Some(email) = profile.email {
        if let Some(existing) = user::Entity::find()
            .filter(user::Column::Email.eq(email))
            .one(db)
            .await?
        {
            return Ok(existing);
        }
    }

    let now = Utc::now();
    let new_user = user::ActiveModel {
        id: Set(Uuid::now_v7().to_string()),
        name: Set(profile.name.to_string()),
        username: Set(profile.username.to_string()),
        email: Set(profile.email.map(|s| s.to_string())),
        avatar_url: Set(profile.avatar_url.map(|s| s.to_string())),
        created_at: Set(now),
        updated_at: Set(now),
    };
    new_user.insert(db).await
}

/// Insert or update the account row for `(provider, provider_account_id)`.
///
/// A fresh login writes a cleared `RefreshState`: re-linking is a successful
/// authentication, so a needs_reauth account returns to healthy here.
pub async fn upsert_account(
    db: &DatabaseConnection,
    user_id: &str,
    login: NewLogin,
) -> Result<account::Model, DbErr> {
    let now = Utc::now();
    let model = account::ActiveModel {
        id: Set(Uuid::now_v7().to_string()),
        user_id: Set(user_id.to_string()),
        provider: Set(login.provider.as_str().to_string()),
        provider_account_id: Set(login.provider_account_id),
        access_token_enc: Set(login.access_token_enc),
        refresh_token_enc: Set(login.refresh_token_enc),
        expires_at: Set(login.expires_at),
        provider_data: Set(ProviderData {
            metadata: login.metadata,
            refresh: RefreshState::default(),
        }),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let on_conflict = OnConflict::columns([
        account::Column::Provider,
        account::Column::ProviderAccountId,
    ])
    .update_columns([
        account::Column::UserId,
        account::Column::AccessTokenEnc,
        account::Column::RefreshTokenEnc,
        account::Column::ExpiresAt,
        account::Column::ProviderData,
        account::Column::UpdatedAt,
    ])
    .to_owned();

    account::Entity::insert(model)
        .on_conflict(on_conflict)
        .exec_with_returning(db)
        .await
}

pub async fn create_session(
    db: &DatabaseConnection,
    user_id: &str,
    ttl: chrono::Duration,
) -> Result<session::Model, DbErr> {
    let now = Utc::now();
    let model = session::ActiveModel {
        session_token: Set(Uuid::new_v4().to_string()),
        user_id: Set(user_id.to_string()),
        expires_at: Set(now + ttl),
        created_at: Set(now),
        last_seen_at: Set(now),
    };
    model.insert(db).await
}

pub async fn find_session(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<session::Model>, DbErr> {
    session::Entity::find_by_id(token).one(db).await
}

pub async fn delete_session(db: &DatabaseConnection, token: &str) -> Result<(), DbErr> {
    session::Entity::delete_by_id(token).exec(db).await?;
    Ok(())
}

/// Best-effort activity stamp; callers ignore the error.
pub async fn touch_last_seen(db: &DatabaseConnection, token: &str) -> Result<(), DbErr> {
    session::Entity::update_many()
        .col_expr(session::Column::LastSeenAt, Expr::value(Utc::now()))
        .filter(session::Column::SessionToken.eq(token))
        .exec(db)
        .await?;
    Ok(())
}

/// The account backing a session bundle: the bluesky identity when linked
/// (it is the canonical identity for posting), otherwise any linked account.
pub async fn find_account_for_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Option<account::Model>, DbErr> {
    if let Some(bsky) = account::Entity::find()
        .filter(account::Column::UserId.eq(user_id))
        .filter(account::Column::Provider.eq(Provider::Bluesky.as_str()))
        .one(db)
        .await?
    {
        return Ok(Some(bsky));
    }

    account::Entity::find()
        .filter(account::Column::UserId.eq(user_id))
        .one(db)
        .await
}

pub async fn list_accounts(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<account::Model>, DbErr> {
    account::Entity::find()
        .filter(account::Column::UserId.eq(user_id))
        .order_by_desc(account::Column::UpdatedAt)
        .all(db)
        .await
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Unlinked,
    /// Refused: unlinking the only linked provider would strand the user.
    LastProvider,
    NotLinked,
}

pub async fn unlink_account(
    db: &DatabaseConnection,
    user_id: &str,
    provider: Provider,
) -> Result<UnlinkOutcome, DbErr> {
    let Some(target) = account::Entity::find()
        .filter(account::Column::UserId.eq(user_id))
        .filter(account::Column::Provider.eq(provider.as_str()))
        .one(db)
        .await?
    else {
        return Ok(UnlinkOutcome::NotLinked);
    };

    let linked = account::Entity::find()
        .filter(account::Column::UserId.eq(user_id))
        .count(db)
        .await?;
    if linked <= 1 {
        return Ok(UnlinkOutcome::LastProvider);
    }

    account::Entity::delete_by_id(&target.id).exec(db).await?;
    Ok(UnlinkOutcome::Unlinked)
}

/// Accounts whose access token expires on or before `cutoff`, soonest first,
/// capped at `limit`.
///
/// By default accounts with no stored refresh credential and accounts already
/// flagged needs_reauth are excluded: neither can succeed without the user
/// re-linking, and retrying them every pass only inflates failure counters.
/// `retry_needs_reauth` restores the retry-forever behavior. The needs_reauth
/// flag lives inside the JSON column, so that part of the filter runs here
/// rather than in SQL to stay portable across sqlite and postgres.
pub async fn refresh_candidates(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
    limit: u64,
    retry_needs_reauth: bool,
) -> Result<Vec<account::Model>, DbErr> {
    let mut query = account::Entity::find()
        .filter(account::Column::ExpiresAt.is_not_null())
        .filter(account::Column::ExpiresAt.lte(cutoff));

    if !retry_needs_reauth {
        query = query.filter(account::Column::RefreshTokenEnc.ne(""));
    }
    let query = query.order_by_asc(account::Column::ExpiresAt);

    if retry_needs_reauth {
        return query.limit(limit).all(db).await;
    }

    // Flagged rows sort first (stalest expiry) and would otherwise occupy
    // the whole batch; page past them until the quota is met or the table
    // is exhausted.
    let mut out: Vec<account::Model> = Vec::new();
    let mut offset = 0u64;
    loop {
        let page = query
            .clone()
            .offset(offset)
            .limit(limit)
            .all(db)
            .await?;
        let fetched = page.len() as u64;

        out.extend(
            page.into_iter()
                .filter(|a| !a.provider_data.refresh.needs_reauth),
        );
        if out.len() as u64 >= limit || fetched < limit {
            break;
        }
        offset += fetched;
    }
    out.truncate(limit as usize);
    Ok(out)
}

/// Persist a successful refresh: re-sealed tokens, new expiry, cleared
/// failure bookkeeping, all in one row update. Replaying the same result is
/// idempotent.
pub async fn apply_refresh_success(
    db: &DatabaseConnection,
    account: &account::Model,
    cred: &RefreshedCredential,
    sealer: &Sealer,
    now: DateTime<Utc>,
) -> anyhow::Result<account::Model> {
    let access_enc = sealer.seal_b64(&cred.access_token)?;
    let refresh_enc = match &cred.refresh_token {
        Some(token) => sealer.seal_b64(token)?,
        // Rotation-less grant: the stored refresh credential stays valid.
        None => account.refresh_token_enc.clone(),
    };

    let mut data = account.provider_data.clone();
    data.refresh = RefreshState {
        fail_count: 0,
        needs_reauth: false,
        last_refreshed_at: Some(now),
        last_failure_at: None,
        last_failure_error: None,
    };

    let updated = account::ActiveModel {
        id: Set(account.id.clone()),
        access_token_enc: Set(access_enc),
        refresh_token_enc: Set(refresh_enc),
        expires_at: Set(cred.expires_at.or(account.expires_at)),
        provider_data: Set(data),
        updated_at: Set(now),
        ..Default::default()
    }
    .update(db)
    .await?;

    Ok(updated)
}

/// Record one failed refresh attempt: +1 on the counter, failure fields
/// stamped, needs_reauth flipped once the count reaches `threshold`. The row
/// is re-read first so the increment applies to current state (the scheduler
/// guarantees a single writer via its pass guard).
pub async fn record_refresh_failure(
    db: &DatabaseConnection,
    account_id: &str,
    error: &RefreshError,
    threshold: u32,
    now: DateTime<Utc>,
) -> Result<account::Model, DbErr> {
    let Some(current) = account::Entity::find_by_id(account_id).one(db).await? else {
        return Err(DbErr::RecordNotFound(format!("account {account_id}")));
    };

    let mut data = current.provider_data.clone();
    data.refresh.fail_count = data.refresh.fail_count.saturating_add(1);
    data.refresh.last_failure_at = Some(now);
    data.refresh.last_failure_error = Some(error.to_string());
    if data.refresh.fail_count >= threshold {
        data.refresh.needs_reauth = true;
    }

    account::ActiveModel {
        id: Set(current.id.clone()),
        provider_data: Set(data),
        updated_at: Set(now),
        ..Default::default()
    }
    .update(db)
    .await
}

/// Admin listing of accounts stuck in needs_reauth, most recently touched
/// first. The flag lives in the JSON column, hence the in-process filter,
/// applied page by page so the scan stays bounded by `limit`-sized reads.
pub async fn accounts_needing_reauth(
    db: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<(account::Model, Option<user::Model>)>, DbErr> {
    let query = account::Entity::find()
        .find_also_related(user::Entity)
        .order_by_desc(account::Column::UpdatedAt);

    let mut out: Vec<(account::Model, Option<user::Model>)> = Vec::new();
    let mut offset = 0u64;
    loop {
        let page = query
            .clone()
            .offset(offset)
            .limit(limit)
            .all(db)
            .await?;
        let fetched = page.len() as u64;

        out.extend(
            page.into_iter()
                .filter(|(a, _)| a.provider_data.refresh.needs_reauth),
        );
        if out.len() as u64 >= limit || fetched < limit {
            break;
        }
        offset += fetched;
    }
    out.truncate(limit as usize);
    Ok(out)
}
