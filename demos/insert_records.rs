use chrono::Duration;
use hems_storage::{
    BackendKind, FieldRecord, NamespaceProvider, StorageConfig, StorageEngine, Timestamp,
};

struct PvForecast;

impl NamespaceProvider for PvForecast {
    fn namespace_id(&self) -> String {
        "pv_forecast".to_string()
    }
}

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

    println!("=== Record Insertion Example ===\n");

    let data_dir = std::env::args().nth(1).unwrap_or_else(|| "demo-data".to_string());
    let mut config = StorageConfig::with_backend(BackendKind::Lmdb, &data_dir);
    config.persistence.lmdb_map_size = 256 * 1024 * 1024;
    println!("Data directory: {}\n", data_dir);

    let mut engine = StorageEngine::new(config)?;
    let forecast = engine.open::<FieldRecord, _>(&PvForecast)?;
    let meter = engine.open::<FieldRecord, _>(&GridMeter)?;

    // Example 1: hourly forecast for the next two days
    println!("1. Inserting 48 hourly forecast records...");
    let now = Timestamp::now().floor(Duration::hours(1));
    {
        let mut forecast = forecast.lock();
        for hour in 0..48 {
            let at = now + Duration::hours(hour);
            let wh = (((hour % 24) as f64 - 12.0).abs() * -90.0 + 1080.0).max(0.0);
            if let Err(e) = forecast.insert(FieldRecord::new(at).with_field("pv_wh", wh)) {
                println!("   skipped {}: {}", at, e);
            }
        }
    }
    println!("   ✓ Inserted forecast\n");

    // Example 2: a week of minute readings
    println!("2. Inserting one week of meter readings...");
    let start = now - Duration::days(7);
    let mut inserted = 0;
    {
        let mut meter = meter.lock();
        for minute in 0..(7 * 24 * 60) {
            let at = start + Duration::minutes(minute);
            let record = FieldRecord::new(at)
                .with_field("import_wh", 5.0 + (minute % 60) as f64 / 10.0)
                .with_field("phase", "L1");
            if meter.insert(record).is_ok() {
                inserted += 1;
            }
        }
    }
    println!("   ✓ Inserted {} readings\n", inserted);

    // Example 3: persist and downsample
    println!("3. Saving and running maintenance...");
    engine.save_all()?;
    for report in engine.run_maintenance() {
        let merged = report.compaction.map_or(0, |c| c.records_removed());
        println!("   {}: {} records compacted", report.namespace, merged);
    }
    println!();

    for stats in engine.stats()? {
        println!(
            "   {}: {} in memory, {:?} stored",
            stats.namespace, stats.records_in_memory, stats.records_stored
        );
    }

    drop(forecast);
    drop(meter);
    engine.shutdown()?;
    println!("\n=== Example Complete ===");

    Ok(())
}
