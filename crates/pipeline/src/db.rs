use diesel::prelude::*;
use diesel_async::{
    pooled_connection::{deadpool::Pool, AsyncDieselConnectionManager, ManagerConfig},
    AsyncPgConnection, RunQueryDsl,
};

pub type DbPool = Pool<AsyncPgConnection>;

async fn establish_tls_connection(config: String) -> diesel::ConnectionResult<AsyncPgConnection> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

    let (client, connection) = tokio_postgres::connect(&config, tls)
        .await
        .map_err(|e| diesel::ConnectionError::BadConnection(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error: {}", e);
        }
    });

    AsyncPgConnection::try_from(client).await
}

/// Build the connection pool. TLS is used unless the URL opts out with
/// `sslmode=disable` (local development databases).
pub fn establish_connection_pool(database_url: &str, max_size: usize) -> anyhow::Result<DbPool> {
    let config = if database_url.contains("sslmode=disable") {
        AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url)
    } else {
        let mut manager_config = ManagerConfig::default();
        manager_config.custom_setup =
            Box::new(|url| Box::pin(establish_tls_connection(url.to_string())));
        AsyncDieselConnectionManager::<AsyncPgConnection>::new_with_config(
            database_url,
            manager_config,
        )
    };

    let pool = Pool::builder(config).max_size(max_size).build()?;

    Ok(pool)
}

// Email database operations
pub mod emails {
    use super::*;
    use shared_types::Email;
    use uuid::Uuid;

    use crate::models::{EmailAnalysisUpdate, NewEmail};

    pub async fn exists(
        conn: &mut AsyncPgConnection,
        owner: Uuid,
        protocol_id: &str,
    ) -> Result<bool, diesel::result::Error> {
        use crate::schema::emails::dsl::*;

        let count: i64 = emails
            .filter(user_id.eq(owner))
            .filter(message_id.eq(protocol_id))
            .count()
            .get_result(conn)
            .await?;

        Ok(count > 0)
    }

    /// Insert a new email, returning it. Uses ON CONFLICT DO NOTHING to handle duplicates.
    pub async fn insert(
        conn: &mut AsyncPgConnection,
        new_email: &NewEmail,
    ) -> Result<Option<Email>, diesel::result::Error> {
        use crate::schema::emails::dsl::*;

        diesel::insert_into(emails)
            .values(new_email)
            .on_conflict((user_id, message_id))
            .do_nothing()
            .get_result::<Email>(conn)
            .await
            .optional()
    }

    pub async fn get_by_id(
        conn: &mut AsyncPgConnection,
        owner: Uuid,
        email_id: Uuid,
    ) -> Result<Option<Email>, diesel::result::Error> {
        use crate::schema::emails::dsl::*;

        emails
            .filter(id.eq(email_id))
            .filter(user_id.eq(owner))
            .first::<Email>(conn)
            .await
            .optional()
    }

    pub async fn apply_analysis(
        conn: &mut AsyncPgConnection,
        owner: Uuid,
        email_id: Uuid,
        update: &EmailAnalysisUpdate,
    ) -> Result<Option<Email>, diesel::result::Error> {
        use crate::schema::emails::dsl::*;

        diesel::update(emails.filter(id.eq(email_id)).filter(user_id.eq(owner)))
            .set(update)
            .get_result::<Email>(conn)
            .await
            .optional()
    }

    pub async fn list_unanalyzed(
        conn: &mut AsyncPgConnection,
        owner: Uuid,
        max: i64,
    ) -> Result<Vec<Email>, diesel::result::Error> {
        use crate::schema::emails::dsl::*;

        emails
            .filter(user_id.eq(owner))
            .filter(analyzed_at.is_null())
            .order_by(received_at.asc())
            .limit(max)
            .load::<Email>(conn)
            .await
    }
}

// Contact database operations
//
// Both writes are one INSERT .. ON CONFLICT DO UPDATE statement so concurrent
// sync-time and analysis-time updates never interleave a read and a write.
// The SET clause sees the row as it was before the statement, which is what
// the incremental mean needs.
pub mod contacts {
    use super::*;
    use diesel::sql_types::{Float8, Text, Timestamptz};
    use uuid::Uuid;

    use crate::models::{ContactRow, Interaction, SentimentObservation};

    pub(super) const RECORD_INTERACTION: &str = "\
        INSERT INTO contacts (user_id, email_address, display_name, interaction_count, last_interaction_at) \
        VALUES ($1, $2, $3, 1, $4) \
        ON CONFLICT (user_id, email_address) DO UPDATE SET \
            interaction_count = contacts.interaction_count + 1, \
            display_name = EXCLUDED.display_name, \
            last_interaction_at = GREATEST(contacts.last_interaction_at, EXCLUDED.last_interaction_at), \
            updated_at = NOW() \
        RETURNING *";

    pub(super) const RECORD_SENTIMENT: &str = "\
        INSERT INTO contacts (user_id, email_address, interaction_count, avg_sentiment, sentiment_samples, last_interaction_at) \
        VALUES ($1, $2, 0, $3, 1, $4) \
        ON CONFLICT (user_id, email_address) DO UPDATE SET \
            avg_sentiment = (contacts.avg_sentiment * contacts.sentiment_samples + EXCLUDED.avg_sentiment) \
                / (contacts.sentiment_samples + 1), \
            sentiment_samples = contacts.sentiment_samples + 1, \
            last_interaction_at = GREATEST(contacts.last_interaction_at, EXCLUDED.last_interaction_at), \
            updated_at = NOW() \
        RETURNING *";

    pub async fn record_interaction(
        conn: &mut AsyncPgConnection,
        interaction: &Interaction,
    ) -> Result<ContactRow, diesel::result::Error> {
        diesel::sql_query(RECORD_INTERACTION)
            .bind::<diesel::sql_types::Uuid, _>(interaction.user_id)
            .bind::<Text, _>(&interaction.email_address)
            .bind::<Text, _>(&interaction.display_name)
            .bind::<Timestamptz, _>(interaction.at)
            .get_result::<ContactRow>(conn)
            .await
    }

    pub async fn record_sentiment(
        conn: &mut AsyncPgConnection,
        observation: &SentimentObservation,
    ) -> Result<ContactRow, diesel::result::Error> {
        diesel::sql_query(RECORD_SENTIMENT)
            .bind::<diesel::sql_types::Uuid, _>(observation.user_id)
            .bind::<Text, _>(&observation.email_address)
            .bind::<Float8, _>(observation.value)
            .bind::<Timestamptz, _>(observation.at)
            .get_result::<ContactRow>(conn)
            .await
    }

    pub async fn get_by_address(
        conn: &mut AsyncPgConnection,
        owner: Uuid,
        address: &str,
    ) -> Result<Option<ContactRow>, diesel::result::Error> {
        use crate::schema::contacts::dsl::*;

        contacts
            .filter(user_id.eq(owner))
            .filter(email_address.eq(address))
            .select(ContactRow::as_select())
            .first::<ContactRow>(conn)
            .await
            .optional()
    }
}

// Email account database operations
pub mod email_accounts {
    use super::*;
    use shared_types::EmailAccount;
    use uuid::Uuid;

    use crate::models::SyncOutcome;

    pub async fn list_active(
        conn: &mut AsyncPgConnection,
    ) -> Result<Vec<EmailAccount>, diesel::result::Error> {
        use crate::schema::email_accounts::dsl::*;

        email_accounts
            .filter(is_active.eq(true))
            .order_by(last_synced.asc().nulls_first())
            .load::<EmailAccount>(conn)
            .await
    }

    pub async fn get_by_id(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
    ) -> Result<Option<EmailAccount>, diesel::result::Error> {
        use crate::schema::email_accounts::dsl::*;

        email_accounts
            .filter(id.eq(account_id))
            .first::<EmailAccount>(conn)
            .await
            .optional()
    }

    pub async fn record_sync(
        conn: &mut AsyncPgConnection,
        account_id: Uuid,
        outcome: &SyncOutcome,
    ) -> Result<usize, diesel::result::Error> {
        use crate::schema::email_accounts::dsl::*;

        let target = email_accounts.filter(id.eq(account_id));
        match outcome.last_synced {
            Some(watermark) => {
                diesel::update(target)
                    .set((
                        sync_status.eq(outcome.status.as_str()),
                        last_sync_error.eq(outcome.error.as_deref()),
                        last_synced.eq(Some(watermark)),
                    ))
                    .execute(conn)
                    .await
            }
            None => {
                diesel::update(target)
                    .set((
                        sync_status.eq(outcome.status.as_str()),
                        last_sync_error.eq(outcome.error.as_deref()),
                    ))
                    .execute(conn)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::contacts::{self, RECORD_INTERACTION, RECORD_SENTIMENT};
    use super::*;
    use crate::models::{Interaction, SentimentObservation};
    use chrono::{TimeZone, Utc};
    use diesel_async::{AsyncConnection, SimpleAsyncConnection};
    use uuid::Uuid;

    const UP_SQL: &str =
        include_str!("../migrations/2026-01-05-000000_create_pipeline_tables/up.sql");

    #[test]
    fn test_sentiment_upsert_uses_prior_sample_count() {
        assert!(RECORD_SENTIMENT.contains("ON CONFLICT (user_id, email_address) DO UPDATE"));
        assert!(RECORD_SENTIMENT.contains(
            "(contacts.avg_sentiment * contacts.sentiment_samples + EXCLUDED.avg_sentiment) \
                / (contacts.sentiment_samples + 1)"
        ));
        assert!(RECORD_SENTIMENT.contains("sentiment_samples = contacts.sentiment_samples + 1"));
        assert!(!RECORD_SENTIMENT.contains("interaction_count = contacts.interaction_count"));
    }

    #[test]
    fn test_interaction_upsert_leaves_average_alone() {
        assert!(RECORD_INTERACTION.contains("ON CONFLICT (user_id, email_address) DO UPDATE"));
        assert!(RECORD_INTERACTION.contains("interaction_count = contacts.interaction_count + 1"));
        assert!(RECORD_INTERACTION.contains("GREATEST(contacts.last_interaction_at"));
        assert!(!RECORD_INTERACTION.contains("avg_sentiment ="));
        assert!(!RECORD_INTERACTION.contains("sentiment_samples ="));
    }

    /// Runs against a scratch schema when TEST_DATABASE_URL is set; the
    /// test transaction rolls everything back.
    #[tokio::test]
    async fn test_contact_upserts_against_postgres() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping");
            return;
        };

        let mut conn = AsyncPgConnection::establish(&url).await.unwrap();
        conn.begin_test_transaction().await.unwrap();
        let schema = format!("pipeline_test_{}", Uuid::new_v4().simple());
        conn.batch_execute(&format!(
            "CREATE SCHEMA {schema}; SET LOCAL search_path TO {schema};"
        ))
        .await
        .unwrap();
        conn.batch_execute(UP_SQL).await.unwrap();

        let user_id = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(2026, 4, 2, 9, 30, 0).unwrap();
        let interaction = Interaction {
            user_id,
            email_address: "boss@example.com".to_string(),
            display_name: "Boss".to_string(),
            at,
        };

        for (n, value) in [1.0, -1.0, 0.0, 1.0].into_iter().enumerate() {
            if n % 2 == 0 {
                contacts::record_interaction(&mut conn, &interaction)
                    .await
                    .unwrap();
            }
            let observation = SentimentObservation {
                user_id,
                email_address: "boss@example.com".to_string(),
                value,
                at: at + chrono::Duration::minutes(n as i64),
            };
            contacts::record_sentiment(&mut conn, &observation)
                .await
                .unwrap();
        }

        let row = contacts::get_by_address(&mut conn, user_id, "boss@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.interaction_count, 2);
        assert_eq!(row.sentiment_samples, 4);
        assert!((row.avg_sentiment - 0.25).abs() < 1e-12);
        assert_eq!(row.display_name, "Boss");
        assert_eq!(row.last_interaction_at, at + chrono::Duration::minutes(3));
    }
}
