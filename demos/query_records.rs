use chrono::Duration;
use hems_storage::{
    BackendKind, FieldRecord, NamespaceProvider, StorageConfig, StorageEngine, Timestamp, Window,
};

struct GridMeter;

impl NamespaceProvider for GridMeter {
    fn namespace_id(&self) -> String {
        "grid_meter".to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    hems_storage::init_tracing();

    println!("=== Record Query Example ===\n");

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "demo-data".to_string());
    let mut config = StorageConfig::with_backend(BackendKind::Lmdb, &data_dir);
    config.persistence.lmdb_map_size = 256 * 1024 * 1024;
    config.store.initial_load_window_h = Some(24);

    let mut engine = StorageEngine::new(config)?;
    let meter = engine.open::<FieldRecord, _>(&GridMeter)?;
    let mut meter = meter.lock();

    // Example 1: last hour, served from the initial window
    println!("1. Readings from the last hour...");
    let now = Timestamp::now();
    let recent = meter.range(now - Duration::hours(1), now)?;
    println!("   Found {} readings", recent.len());
    println!("   Load phase: {}\n", meter.load_phase());

    // Example 2: nearest reading three days back expands the loaded range
    println!("2. Nearest reading three days ago (±30 min)...");
    let target = now - Duration::days(3);
    match meter.get(target, Window::Span(Duration::minutes(30)))? {
        Some(record) => println!(
            "   {} import_wh={:?}",
            record.timestamp,
            record.number("import_wh")
        ),
        None => println!("   none"),
    }
    if let Some(range) = meter.loaded_range() {
        println!("   Loaded: {} .. {}\n", range.start, range.end);
    }

    // Example 3: whole namespace
    println!("3. Oldest and newest reading...");
    let oldest = meter.min_timestamp()?;
    let newest = meter.max_timestamp()?;
    println!("   {:?} .. {:?}", oldest.map(|t| t.to_string()), newest.map(|t| t.to_string()));
    println!("   Load phase: {}\n", meter.load_phase());

    let corrupt = meter.take_corrupt();
    if !corrupt.is_empty() {
        println!("   {} corrupt records skipped", corrupt.len());
    }

    drop(meter);
    engine.shutdown()?;
    println!("=== Example Complete ===");

    Ok(())
}
