//! Walks a user through create, rename and destroy, then prints the stream.
//!
//! Uses Postgres when `DATABASE_URL` is set, the in-memory store otherwise.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use keel_core::{Aggregate, AggregateId};
use keel_events::BindingInfo;
use keel_infra::{
    ApplierConfig, ApplyError, EventApplier, InMemoryRecordStore, PostgresRecordStore,
    RecordStore, StoreConfig,
};
use keel_users::{registry, User, UserCreated, UserDestroyed, UserRenamed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keel_observability::init();

    let applier_config = ApplierConfig::from_env()?;
    let store_config = StoreConfig::from_env()?;
    let registry = Arc::new(registry()?);

    if store_config.is_persistent() {
        let store = PostgresRecordStore::connect(&store_config).await?;
        store
            .ensure_schema(&BindingInfo::of::<UserCreated>())
            .await?;
        run(EventApplier::with_config(store, applier_config).with_registry(registry)).await
    } else {
        info!("DATABASE_URL not set; using the in-memory store");
        let store = InMemoryRecordStore::new().with_unique_field(User::TABLE, "email");
        run(EventApplier::with_config(store, applier_config).with_registry(registry)).await
    }
}

async fn run<S: RecordStore>(applier: EventApplier<S>) -> anyhow::Result<()> {
    // Create: no reference, so a new user row is inserted.
    let mut created = UserCreated::new();
    created.set_name("Ada Lovelace".to_string())?;
    created.set_email(format!("ada+{}@example.com", AggregateId::new()))?;
    let applied = applier.apply(created).await?;
    let user_id = applied.stored.aggregate_ref;
    info!(%user_id, name = %applied.aggregate.name, "user created");

    let mut renamed = UserRenamed::for_aggregate(user_id);
    renamed.set_name("Ada King".to_string())?;
    let applied = applier.apply(renamed).await?;
    info!(%user_id, name = %applied.aggregate.name, "user renamed");

    let mut stray = UserRenamed::for_aggregate(AggregateId::new());
    stray.set_name("Nobody".to_string())?;
    match applier.apply(stray).await {
        Err(err @ ApplyError::AggregateNotFound { .. }) => {
            info!(error = %err, "unknown user rejected");
        }
        Err(other) => return Err(other.into()),
        Ok(_) => anyhow::bail!("renaming an unknown user must fail"),
    }

    let applied = applier.apply(UserDestroyed::for_aggregate(user_id)).await?;
    info!(%user_id, deleted_at = ?applied.aggregate.deleted_at, "user destroyed");

    let registry = applier
        .registry()
        .context("demo applier is built with a registry")?;
    for event in applier.history::<UserCreated>(user_id).await? {
        let binding = registry.binding_for(&event.event_type)?;
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_type = binding.aggregate_type,
            created_at = %event.created_at,
            payload = %event.payload.clone().into_value(),
            "stored event"
        );
    }

    let user = applier
        .load::<User>(user_id)
        .await?
        .context("user row disappeared")?;
    info!(%user_id, deleted = user.is_deleted(), "final state");
    Ok(())
}
