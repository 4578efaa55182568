use std::sync::Arc;
use table_window::{LoaderConfig, MemoryTransport, Source, TableLoader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A resource served with range semantics from memory; swap in
    // `TableLoader::new(config)?` to hit a real server.
    let mut csv = String::from("sku,qty,note\n");
    for i in 0..50_000 {
        csv.push_str(&format!("SKU{i:06},{},\"row {i}\nsecond line\"\n", i % 7));
    }
    let transport = Arc::new(MemoryTransport::new(csv).with_content_type("text/csv"));
    let loader = TableLoader::with_transport(LoaderConfig::default(), transport.clone());

    let source = Source::parse("https://data.example.com/exports/inventory.csv")?;
    let result = loader.load(&source, 1_000, 5).await?;

    for row in &result.rows {
        let sku = row.get("sku").unwrap_or("");
        let qty = row.get("qty").unwrap_or("");
        println!("{sku} qty={qty}");
    }
    if let Some(diag) = &result.diagnostics {
        println!(
            "scanned={} bytes={} requests={} (of {} total)",
            diag.scanned_rows,
            diag.bytes_fetched_total,
            diag.range_request_count,
            diag.content_length.unwrap_or_default()
        );
    }
    Ok(())
}
