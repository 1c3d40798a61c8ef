use pgline::{BatchCommand, Config, Connector, PgStream, TypeRegistry};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    let tcp = TcpStream::connect((config.get_host(), config.get_port())).await?;
    let mut conn = Connector::handshake(PgStream::new(tcp), &config).await?;

    conn.simple_query("CREATE TEMP TABLE demo(id int4, note text)").await?;

    let registry = TypeRegistry::default();
    let mut batch = conn.take_batch();
    batch
        .push(BatchCommand::new("INSERT INTO demo VALUES ($1, $2)").bind(1i32).bind("first"))
        .push(BatchCommand::new("INSERT INTO demo VALUES ($1, $2)").bind(2i32).bind("second"))
        .push(BatchCommand::new("SELECT id, note FROM demo ORDER BY id"));

    let result = conn.run_batch(&mut batch, &registry).await?;
    for row in result.outcomes[2].rows() {
        println!(
            "id={:?} note={:?}",
            row.decode("id", &registry)?,
            row.decode("note", &registry)?,
        );
    }

    conn.store_batch(batch);
    conn.close().await?;
    Ok(())
}
