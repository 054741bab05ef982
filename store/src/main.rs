//! docstash demo - runs a read-then-write batch against the in-memory engine.
//!
//! Set `DOCSTASH_SNAPSHOT_PATH` to keep the database between runs; every run
//! then bumps the visit counter of the same user and adds another note.

#[cfg(not(target_arch = "wasm32"))]
mod demo {
    use docstash_engine::{
        store_schema, Collection, CollectionSchema, FieldDef, FieldType, Snapshot,
    };
    use docstash_store::backend::memory::MemoryBackend;
    use docstash_store::{Config, DocStore};
    use serde::{Deserialize, Serialize};
    use std::error::Error;

    pub const USER_ID: &str = "user_demo";

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct User {
        pub name: String,
        pub visits: u32,
    }

    pub struct Users;

    impl Collection for Users {
        const NAME: &'static str = "users";
        type Doc = User;

        fn schema() -> CollectionSchema {
            CollectionSchema::new(
                Self::NAME,
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::required("visits", FieldType::Int),
                ],
            )
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Note {
        pub title: String,
        pub author_id: String,
    }

    pub struct Notes;

    impl Collection for Notes {
        const NAME: &'static str = "notes";
        type Doc = Note;

        fn schema() -> CollectionSchema {
            CollectionSchema::new(
                Self::NAME,
                vec![
                    FieldDef::required("title", FieldType::String),
                    FieldDef::required("authorId", FieldType::String),
                ],
            )
        }
    }

    store_schema! {
        pub struct DemoSchema {
            version: 1,
            collections: [Users, Notes],
        }
    }

    pub async fn load_backend(config: &Config) -> Result<MemoryBackend, Box<dyn Error>> {
        let Some(path) = &config.snapshot_path else {
            return Ok(MemoryBackend::new());
        };

        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let snapshot = Snapshot::from_json(&json)?;
                tracing::info!(
                    path = %path.display(),
                    records = snapshot.record_count(),
                    "Restored snapshot"
                );
                Ok(MemoryBackend::from_snapshot(snapshot)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MemoryBackend::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save_backend(config: &Config, backend: &MemoryBackend) -> Result<(), Box<dyn Error>> {
        if let Some(path) = &config.snapshot_path {
            let snapshot = backend.snapshot();
            tokio::fs::write(path, snapshot.to_json_pretty()?).await?;
            tracing::info!(
                path = %path.display(),
                records = snapshot.record_count(),
                "Saved snapshot"
            );
        }
        Ok(())
    }

    pub async fn run(config: Config) -> Result<(), Box<dyn Error>> {
        let backend = load_backend(&config).await?;
        let store: DocStore<DemoSchema, _> = DocStore::new(backend.clone(), config.clone());

        let client_id = store.client_id().await?;
        tracing::info!(client_id = %client_id, "Client ready");

        let note_id = store.generate_document_id();
        let report = store
            .execute([USER_ID], |batch, found| {
                match found.into_iter().next().flatten() {
                    Some(user) => {
                        let mut user = user.into_typed::<User>()?;
                        user.body.visits += 1;
                        batch.replace::<Users>(user)?;
                    }
                    None => {
                        batch.add::<Users>(
                            USER_ID,
                            User {
                                name: "Demo User".into(),
                                visits: 1,
                            },
                        )?;
                    }
                }

                batch.add::<Notes>(
                    note_id.clone(),
                    Note {
                        title: format!("Written by {client_id}"),
                        author_id: USER_ID.into(),
                    },
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(
            mutations = report.mutations,
            batch_id = ?report.batch_id,
            "Batch executed"
        );

        if let Some(user) = store.get::<Users>(USER_ID).await? {
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        for note in store.documents_in::<Notes>().await? {
            println!("{}", serde_json::to_string(&note)?);
        }
        println!(
            "{} batches have touched notes",
            store.batches_touching(Notes::NAME).await?.len()
        );

        save_backend(&config, &backend).await
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docstash_store=debug,docstash_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = docstash_store::Config::from_env()?;

    tracing::info!(
        "Starting docstash demo on database {} v{}",
        config.database_name,
        config.database_version
    );

    demo::run(config).await
}

#[cfg(target_arch = "wasm32")]
fn main() {}
