use anyhow::{Context, Result};
use cypher_mapper::{
    ConnectionConfig, Direction, EntitySchema, Mapper, MapperConfig, Neo4jConnection, NewEntity,
    Phase, Property, PropertyKind, RelationshipQuery, SchemaKind,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 Cypher mapper demo starting...");

    let config = ConnectionConfig::from_env();
    let connection = Neo4jConnection::connect(&config)
        .await
        .context("Failed to connect to Neo4j")?;

    let mut mapper = Mapper::with_config(connection, MapperConfig::default());
    mapper.register(
        EntitySchema::node("Person")
            .field("name", PropertyKind::String)
            .property(Property::new("created", PropertyKind::TimeStamp))
            .property(Property::new("visits", PropertyKind::Increment).with_default(0)),
    );

    mapper.on("Person", Phase::AfterCreate, |person, _| {
        info!("👤 Created {:?} with id {:?}", person.get("name"), person.id());
        Ok(())
    });
    mapper.on_property_changed("Person", "name", |person, change| {
        info!("✏️  Person {:?} renamed from {:?} to {:?}", person.id(), change.from, change.to);
        Ok(())
    });

    // Two new people and a relationship between them, flushed as one statement
    let mark = mapper.create_node("Person", NewEntity::new().property("name", "mark"))?;
    let someone = mapper.create_node("Person", NewEntity::new().property("name", "someone"))?;
    let follows = mapper.create_relationship(
        "Follows",
        mark,
        someone,
        NewEntity::new().property("since", 2024),
    )?;
    mapper.save(follows)?;

    for statement in mapper.queries()? {
        info!("📝 {}", statement.text);
    }
    let response = mapper.send().await.context("Failed to save people")?;
    info!("📦 {} row(s) returned", response.result.len());

    // Rename and flush an update
    mapper.entity_mut(mark)?.set("name", "mark II")?;
    mapper.save(mark)?;
    mapper.send().await.context("Failed to update person")?;

    // Load by id and traverse
    let mark_id = mapper.entity(mark)?.id().context("Person was not assigned an id")?;
    if let Some(key) = mapper.get_by_id(mark_id, SchemaKind::Node).await? {
        info!("🔎 Loaded {:?}", mapper.entity(key)?.get("name"));
    }

    let followed = mapper
        .related(
            mark,
            &RelationshipQuery::new("Follows")
                .direction(Direction::Out)
                .end_labels(["Person"])
                .limit(10),
        )
        .await?;
    info!("🧭 mark follows {} people", followed.len());

    // Clean up
    mapper.delete(follows, false)?;
    mapper.send().await.context("Failed to delete relationship")?;
    mapper.delete(mark, true)?;
    mapper.delete(someone, true)?;
    mapper.send().await.context("Failed to delete people")?;

    info!("👋 Cypher mapper demo complete");
    Ok(())
}
