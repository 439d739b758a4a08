use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use memmap2::MmapOptions;
use pbzcat::{decompress, Options};
use std::fs::File;
use std::io::{self, BufWriter, Cursor, Write};
use std::path::PathBuf;
use std::time::Instant;

/// Decompress bzip2 files on all cores.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input bzip2 file (reads stdin when omitted)
    input: Option<PathBuf>,

    /// Output file (writes stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of worker threads (defaults to the number of CPUs)
    #[arg(short = 'n', long)]
    workers: Option<usize>,

    /// Number of 1 MiB input slots kept in flight (defaults to 4 per worker)
    #[arg(long)]
    slots: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut opts = match args.workers {
        Some(n) => Options::new(n),
        None => Options::default(),
    };
    if let Some(slots) = args.slots {
        opts.slots = slots;
    }

    let raw_out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut out = BufWriter::new(raw_out);

    let name = args
        .input
        .as_deref()
        .map_or_else(|| "(stdin)".to_owned(), |p| p.display().to_string());
    let started = Instant::now();

    match &args.input {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            // Regular files are mapped and fed to the splitter as one slice;
            // pipes and other special files fall back to streaming reads.
            match unsafe { MmapOptions::new().map(&file) } {
                Ok(map) => decompress(Cursor::new(&map[..]), &mut out, &opts),
                Err(_) => decompress(file, &mut out, &opts),
            }
        }
        None => decompress(io::stdin(), &mut out, &opts),
    }
    .with_context(|| name.clone())?;

    log::info!("{name}: decompressed in {:.2?}", started.elapsed());
    Ok(())
}
