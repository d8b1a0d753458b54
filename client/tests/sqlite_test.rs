//! End-to-end tests over SQLite storage.

use stash_client::{
    Client, ClientConfig, InMemoryRemote, Query, Source, SqliteStorage, DEFAULT_PIN,
};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod sqlite_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_pin_and_query() {
        init_tracing();
        let remote = Arc::new(InMemoryRemote::new());
        let client = Client::connect(ClientConfig::default(), remote.clone())
            .await
            .unwrap();

        let obj = client.create("GameScore").unwrap();
        obj.set("score", 42).unwrap();
        client.pin(&obj).await.unwrap();
        assert!(client.labels(&obj).await.unwrap().contains(DEFAULT_PIN));

        let found = client
            .find_from(
                &Query::new("GameScore").where_equal_to("score", 42),
                &Source::LocalDatastore,
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        client.save(&obj).await.unwrap();
        assert!(client.labels(&obj).await.unwrap().contains(DEFAULT_PIN));
        client.close().await;
    }

    #[tokio::test]
    async fn test_outbox_reloads_from_sqlite() {
        init_tracing();
        let storage = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_offline(true);

        {
            let client = Client::open(
                ClientConfig::default(),
                Arc::new(storage.clone()),
                remote.clone(),
            )
            .await
            .unwrap();
            let obj = client.create("Note").unwrap();
            obj.set("text", "written offline").unwrap();
            client.save_eventually(&obj).await.unwrap();
            client.close().await;
        }

        remote.set_offline(false);
        let client = Client::open(
            ClientConfig::default(),
            Arc::new(storage.clone()),
            remote.clone(),
        )
        .await
        .unwrap();
        assert_eq!(client.outbox().pending_count(), 1);
        assert_eq!(client.sync_now().await.confirmed, 1);
        assert_eq!(remote.len(), 1);
        assert_eq!(client.outbox().pending_count(), 0);
    }
}
