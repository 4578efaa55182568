use clap::{Arg, ArgAction, Command};
use std::time::Instant;
use table_window::{LoaderConfig, Source, SourceCatalog, TableLoader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("window")
        .about("Load a row window from a remote or local table and print it as JSON")
        .arg(Arg::new("source").long("source").help("http(s) URL, local path or inline JSON").conflicts_with("table"))
        .arg(Arg::new("table").long("table").help("Table name resolved from TABLE_WINDOW_SOURCE_<NAME>"))
        .arg(Arg::new("offset").long("offset").value_parser(clap::value_parser!(u64)).default_value("0"))
        .arg(Arg::new("count").long("count").value_parser(clap::value_parser!(u64)).default_value("100"))
        .arg(Arg::new("chunk-size").long("chunk-size").help("Bytes per range request (clamped to 64KiB..8MiB)").value_parser(clap::value_parser!(u64)))
        .arg(Arg::new("stats").long("stats").help("Print elapsed time and rows/sec to stderr").action(ArgAction::SetTrue))
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = LoaderConfig::from_env()?;
    if let Some(chunk) = matches.get_one::<u64>("chunk-size") {
        config.chunk_size = *chunk;
    }
    let loader = TableLoader::new(config)?;

    let offset = *matches.get_one::<u64>("offset").unwrap_or(&0);
    let count = *matches.get_one::<u64>("count").unwrap_or(&100);

    let source = if let Some(spec) = matches.get_one::<String>("source") {
        Source::parse(spec).map_err(|e| anyhow::anyhow!(e.describe()))?
    } else if let Some(table) = matches.get_one::<String>("table") {
        SourceCatalog::from_env()
            .resolve(table)
            .map_err(|e| anyhow::anyhow!(e.describe()))?
    } else {
        anyhow::bail!("Provide --source <url|path|json> or --table <name>");
    };

    let start = Instant::now();
    let result = match loader.load(&source, offset, count).await {
        Ok(result) => result,
        Err(err) => {
            eprintln!("{}", err.describe());
            if let Some(diag) = err.diagnostics() {
                eprintln!("diagnostics: {}", serde_json::to_string(diag)?);
            }
            std::process::exit(1);
        }
    };
    let elapsed = start.elapsed().as_secs_f64();

    println!("{}", serde_json::to_string_pretty(&result)?);

    if matches.get_flag("stats") {
        let scanned = result
            .diagnostics
            .as_ref()
            .map_or(result.rows.len() as u64, |d| d.scanned_rows);
        let rps = (scanned as f64) / elapsed.max(f64::EPSILON);
        eprintln!(
            "source={} format={} scanned={} returned={}\nelapsed={:.3}s rows/sec={:.0}",
            source.label(),
            result.format.as_str(),
            scanned,
            result.rows.len(),
            elapsed,
            rps
        );
    }
    Ok(())
}
