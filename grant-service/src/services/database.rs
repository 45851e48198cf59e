use super::error::GrantError;
use super::store::{GrantFilter, GrantStore, Redemption, RuleStore, Store, TokenStore};
use crate::models::{FetchToken, Grant, Rule, Ruler, TokenRecord, VerifyState, VerifyToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson, DateTime as BsonDateTime, Document},
    options::{
        FindOneAndUpdateOptions, FindOptions, IndexOptions, ReplaceOptions, ReturnDocument,
        UpdateOptions,
    },
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

#[derive(Clone)]
pub struct GrantDb {
    client: MongoClient,
    db: Database,
}

fn db_error(op: &'static str) -> impl Fn(mongodb::error::Error) -> GrantError {
    move |e| {
        tracing::error!(operation = op, error = %e, "MongoDB operation failed");
        GrantError::Database(e)
    }
}

fn to_bson_value<T: serde::Serialize>(value: &T) -> Result<mongodb::bson::Bson, GrantError> {
    to_bson(value).map_err(|e| GrantError::Internal(anyhow::anyhow!("BSON encoding failed: {}", e)))
}

impl GrantDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for grant-service");

        let indexes: [(&str, Document, IndexOptions); 5] = [
            (
                "tokens",
                doc! { "verify.token": 1 },
                IndexOptions::builder()
                    .name("verify_token_idx".to_string())
                    .unique(true)
                    .build(),
            ),
            (
                "tokens",
                doc! { "fetch.token": 1 },
                IndexOptions::builder()
                    .name("fetch_token_idx".to_string())
                    .unique(true)
                    .sparse(true)
                    .build(),
            ),
            (
                "rules",
                doc! { "created_utc": 1 },
                IndexOptions::builder()
                    .name("created_utc_idx".to_string())
                    .build(),
            ),
            (
                "grants",
                doc! { "email": 1, "granted_utc": -1 },
                IndexOptions::builder()
                    .name("email_granted_idx".to_string())
                    .build(),
            ),
            (
                "grants",
                doc! { "host": 1, "db": 1, "username": 1 },
                IndexOptions::builder()
                    .name("account_idx".to_string())
                    .build(),
            ),
        ];

        for (collection, keys, options) in indexes {
            let name = options.name.clone().unwrap_or_default();
            let model = IndexModel::builder().keys(keys).options(options).build();
            self.db
                .collection::<Document>(collection)
                .create_index(model, None)
                .await
                .map_err(|e| {
                    tracing::error!("Failed to create {} index on {}: {}", name, collection, e);
                    AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
                })?;
        }

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    fn rules(&self) -> Collection<Rule> {
        self.db.collection("rules")
    }

    fn rulers(&self) -> Collection<Ruler> {
        self.db.collection("rulers")
    }

    fn tokens(&self) -> Collection<TokenRecord> {
        self.db.collection("tokens")
    }

    fn grants(&self) -> Collection<Grant> {
        self.db.collection("grants")
    }
}

#[async_trait]
impl RuleStore for GrantDb {
    async fn list_rules(&self) -> Result<Vec<Rule>, GrantError> {
        let options = FindOptions::builder().sort(doc! { "created_utc": 1 }).build();
        let cursor = self
            .rules()
            .find(doc! {}, options)
            .await
            .map_err(db_error("list_rules"))?;
        cursor.try_collect().await.map_err(db_error("list_rules"))
    }

    async fn find_rule(&self, id: &str) -> Result<Option<Rule>, GrantError> {
        self.rules()
            .find_one(doc! { "_id": id }, None)
            .await
            .map_err(db_error("find_rule"))
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), GrantError> {
        self.rules()
            .insert_one(rule, None)
            .await
            .map_err(db_error("insert_rule"))?;
        Ok(())
    }

    async fn replace_rule(&self, rule: &Rule) -> Result<bool, GrantError> {
        let result = self
            .rules()
            .replace_one(doc! { "_id": rule.id.as_str() }, rule, None)
            .await
            .map_err(db_error("replace_rule"))?;
        Ok(result.matched_count > 0)
    }

    async fn delete_rule(&self, id: &str) -> Result<bool, GrantError> {
        let result = self
            .rules()
            .delete_one(doc! { "_id": id }, None)
            .await
            .map_err(db_error("delete_rule"))?;
        Ok(result.deleted_count > 0)
    }

    async fn list_rulers(&self) -> Result<Vec<Ruler>, GrantError> {
        let options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let cursor = self
            .rulers()
            .find(doc! {}, options)
            .await
            .map_err(db_error("list_rulers"))?;
        cursor.try_collect().await.map_err(db_error("list_rulers"))
    }

    async fn find_ruler(&self, email: &str) -> Result<Option<Ruler>, GrantError> {
        self.rulers()
            .find_one(doc! { "_id": email }, None)
            .await
            .map_err(db_error("find_ruler"))
    }

    async fn upsert_ruler(&self, ruler: &Ruler) -> Result<(), GrantError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.rulers()
            .replace_one(doc! { "_id": ruler.email.as_str() }, ruler, options)
            .await
            .map_err(db_error("upsert_ruler"))?;
        Ok(())
    }

    async fn delete_ruler(&self, email: &str) -> Result<bool, GrantError> {
        let result = self
            .rulers()
            .delete_one(doc! { "_id": email }, None)
            .await
            .map_err(db_error("delete_ruler"))?;
        Ok(result.deleted_count > 0)
    }
}

#[async_trait]
impl TokenStore for GrantDb {
    async fn put_request(&self, email: &str, verify: &VerifyToken) -> Result<(), GrantError> {
        let verify = to_bson_value(verify)?;
        let options = UpdateOptions::builder().upsert(true).build();
        self.tokens()
            .update_one(
                doc! { "_id": email },
                doc! { "$set": { "verify": verify } },
                options,
            )
            .await
            .map_err(db_error("put_request"))?;
        Ok(())
    }

    async fn redeem_verify_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Redemption, GrantError> {
        let now_bson = BsonDateTime::from_chrono(now);
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        // The state predicate makes this a compare-and-swap: only one
        // concurrent caller can match a still-requested token.
        let redeemed = self
            .tokens()
            .find_one_and_update(
                doc! {
                    "verify.token": token,
                    "verify.state": "requested",
                    "verify.expires_utc": { "$gte": now_bson },
                },
                doc! {
                    "$set": {
                        "verify.state": "verified",
                        "verify.verified_utc": now_bson,
                    }
                },
                options,
            )
            .await
            .map_err(db_error("redeem_verify_token"))?;

        if let Some(record) = redeemed {
            return Ok(Redemption::Redeemed(record));
        }

        let existing = self
            .tokens()
            .find_one(doc! { "verify.token": token }, None)
            .await
            .map_err(db_error("redeem_verify_token"))?;

        Ok(match existing {
            None => Redemption::Unknown,
            Some(record) if record.verify.state == VerifyState::Verified => Redemption::AlreadyUsed,
            Some(_) => Redemption::Expired,
        })
    }

    async fn swap_fetch_token(
        &self,
        email: &str,
        expected: Option<&str>,
        fetch: &FetchToken,
    ) -> Result<bool, GrantError> {
        let fetch = to_bson_value(fetch)?;
        // `fetch: null` also matches a record without the field.
        let filter = match expected {
            Some(token) => doc! { "_id": email, "fetch.token": token },
            None => doc! { "_id": email, "fetch": null },
        };
        let result = self
            .tokens()
            .update_one(filter, doc! { "$set": { "fetch": fetch } }, None)
            .await
            .map_err(db_error("swap_fetch_token"))?;
        Ok(result.matched_count > 0)
    }

    async fn find_token_record(&self, email: &str) -> Result<Option<TokenRecord>, GrantError> {
        self.tokens()
            .find_one(doc! { "_id": email }, None)
            .await
            .map_err(db_error("find_token_record"))
    }

    async fn find_by_fetch_token(&self, token: &str) -> Result<Option<TokenRecord>, GrantError> {
        self.tokens()
            .find_one(doc! { "fetch.token": token }, None)
            .await
            .map_err(db_error("find_by_fetch_token"))
    }

    async fn revoke_fetch_token(&self, token: &str) -> Result<bool, GrantError> {
        let result = self
            .tokens()
            .update_one(
                doc! { "fetch.token": token },
                doc! { "$set": { "fetch.revoked": true } },
                None,
            )
            .await
            .map_err(db_error("revoke_fetch_token"))?;
        Ok(result.matched_count > 0)
    }

    async fn purge_inert(&self, cutoff: DateTime<Utc>) -> Result<u64, GrantError> {
        let cutoff = BsonDateTime::from_chrono(cutoff);
        let filter = doc! {
            "$and": [
                { "$or": [
                    { "verify.state": "verified" },
                    { "verify.expires_utc": { "$lt": cutoff } },
                ] },
                { "$or": [
                    { "fetch": { "$exists": false } },
                    { "fetch.revoked": true },
                    { "fetch.expires_utc": { "$lt": cutoff } },
                ] },
                { "verify.requested_utc": { "$lt": cutoff } },
                { "$or": [
                    { "verify.verified_utc": { "$exists": false } },
                    { "verify.verified_utc": { "$lt": cutoff } },
                ] },
                { "$or": [
                    { "fetch": { "$exists": false } },
                    { "fetch.issued_utc": { "$lt": cutoff } },
                ] },
            ]
        };
        let result = self
            .tokens()
            .delete_many(filter, None)
            .await
            .map_err(db_error("purge_inert"))?;
        Ok(result.deleted_count)
    }
}

fn grant_filter_document(filter: &GrantFilter) -> Document {
    let mut query = Document::new();
    if let Some(email) = &filter.email {
        query.insert("email", email.as_str());
    }
    if let Some(host) = &filter.host {
        query.insert("host", host.as_str());
    }
    if let Some(db) = &filter.db {
        query.insert("db", db.as_str());
    }
    if let Some(role) = filter.role {
        query.insert("role", role.as_str());
    }
    if filter.active_only {
        query.insert("revoked_utc", doc! { "$exists": false });
    }
    query
}

#[async_trait]
impl GrantStore for GrantDb {
    async fn record_grant(&self, grant: &Grant) -> Result<(), GrantError> {
        self.grants()
            .insert_one(grant, None)
            .await
            .map_err(db_error("record_grant"))?;
        Ok(())
    }

    async fn find_grants(&self, filter: &GrantFilter) -> Result<Vec<Grant>, GrantError> {
        let options = FindOptions::builder().sort(doc! { "granted_utc": -1 }).build();
        let cursor = self
            .grants()
            .find(grant_filter_document(filter), options)
            .await
            .map_err(db_error("find_grants"))?;
        cursor.try_collect().await.map_err(db_error("find_grants"))
    }

    async fn mark_revoked(&self, grant_ids: &[String], at: DateTime<Utc>) -> Result<u64, GrantError> {
        if grant_ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .grants()
            .update_many(
                doc! {
                    "_id": { "$in": grant_ids.to_vec() },
                    "revoked_utc": { "$exists": false },
                },
                doc! { "$set": { "revoked_utc": BsonDateTime::from_chrono(at) } },
                None,
            )
            .await
            .map_err(db_error("mark_revoked"))?;
        Ok(result.modified_count)
    }
}

#[async_trait]
impl Store for GrantDb {
    async fn ping(&self) -> Result<(), GrantError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(db_error("ping"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn grant_filter_only_constrains_given_fields() {
        let query = grant_filter_document(&GrantFilter {
            email: Some("mcurie@espci.fr".to_string()),
            role: Some(Role::ReadWrite),
            active_only: true,
            ..Default::default()
        });
        assert_eq!(query.get_str("email").unwrap(), "mcurie@espci.fr");
        assert_eq!(query.get_str("role").unwrap(), "readWrite");
        assert!(query.get_document("revoked_utc").is_ok());
        assert!(!query.contains_key("host"));
    }
}
