use clap::{Arg, Command};
use std::io::{self, Write};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write synthetic CSV to stdout for windowed-load experiments")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("no_header")
                .long("no-header")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cols")
                .long("cols")
                .value_parser(clap::value_parser!(usize))
                .default_value("3"),
        )
        .arg(
            Arg::new("quoted_every")
                .long("quoted-every")
                .help("Every N-th row gets a quoted note with an embedded newline and quotes (0 = never)")
                .value_parser(clap::value_parser!(u64))
                .default_value("0"),
        )
        .arg(
            Arg::new("crlf")
                .long("crlf")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let rows = matches.get_one::<u64>("rows").copied().unwrap_or(0);
    let with_header = !matches.get_flag("no_header");
    let cols = matches.get_one::<usize>("cols").copied().unwrap_or(3).max(1);
    let quoted_every = matches.get_one::<u64>("quoted_every").copied().unwrap_or(0);
    let eol = if matches.get_flag("crlf") { "\r\n" } else { "\n" };

    let mut out = io::BufWriter::new(io::stdout().lock());

    if with_header {
        write!(&mut out, "sku")?;
        for i in 1..cols {
            write!(&mut out, ",col{i}")?;
        }
        if quoted_every > 0 {
            write!(&mut out, ",note")?;
        }
        write!(&mut out, "{eol}")?;
    }

    // Deterministic data: sku, col1, col2, ... [, note]
    for i in 0..rows {
        write!(&mut out, "SKU{i:010}")?;
        for c in 1..cols {
            write!(&mut out, ",v{c}_{i}")?;
        }
        if quoted_every > 0 {
            if i % quoted_every == 0 {
                write!(&mut out, ",\"line one of {i}{eol}said \"\"hi\"\", twice\"")?;
            } else {
                write!(&mut out, ",plain")?;
            }
        }
        write!(&mut out, "{eol}")?;
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }

    out.flush()?;
    Ok(())
}
