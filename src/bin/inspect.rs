//! Offline inspection tool for arbor database files: dumps the file header,
//! key index table, free space table and raw records without opening the
//! engine.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use arbor::storage::address::RecordAddress;
use arbor::storage::chunk::parse_header;
use arbor::storage::file::FileLayout;
use arbor::storage::fst::FreeSpaceTable;
use arbor::storage::header::{FileHeader, HEADER_REGION_SIZE};
use arbor::storage::kit::KeyIndexTable;
use arbor::EngineOptions;

#[derive(Parser)]
#[command(name = "arbor-inspect", about = "Inspect arbor database files", version)]
struct Cli {
    /// Database file to inspect.
    file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the file header.
    Header,
    /// List interned keys.
    Kit,
    /// Summarize the free space table.
    Fst,
    /// Hex-dump one or more records and try to parse a node header there.
    Record {
        /// Page number.
        #[arg(long)]
        page: u32,
        /// Record number within the page.
        #[arg(long)]
        record: u16,
        /// Number of consecutive records to dump.
        #[arg(long, default_value_t = 1)]
        count: u16,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> arbor::Result<()> {
    let bytes = fs::read(&cli.file)?;
    if bytes.len() < HEADER_REGION_SIZE {
        return Err(arbor::ArborError::Corruption(
            "file shorter than header region".into(),
        ));
    }
    let Some(header) = FileHeader::read(&bytes[..HEADER_REGION_SIZE])? else {
        return Err(arbor::ArborError::Corruption(
            "file header region is empty".into(),
        ));
    };
    let options = EngineOptions::default()
        .record_size(header.record_size)
        .page_size(header.page_size)
        .max_inline_value_size(header.max_inline_value_size);
    let layout = FileLayout::for_options(&options);

    match &cli.command {
        Command::Header => {
            println!("version:               {}", header.version);
            println!("flags:                 0b{:08b}", header.flags);
            println!("locked:                {}", header.is_locked());
            println!("root address:          {}", header.root_address);
            println!("record size:           {} bytes", header.record_size);
            println!("page size:             {} records", header.page_size);
            println!("max inline value size: {} bytes", header.max_inline_value_size);
        }
        Command::Kit => {
            let region = region(&bytes, layout.kit_offset as usize, layout.kit_len)?;
            let kit = KeyIndexTable::load(region, layout.kit_len)?;
            println!("{} interned keys", kit.len());
            for (index, key) in kit.iter().enumerate() {
                println!("{index:5}  {key}");
            }
        }
        Command::Fst => {
            let region = region(&bytes, layout.fst_offset as usize, layout.fst_len)?;
            let fst = FreeSpaceTable::load(region, header.page_size, usize::MAX)?;
            let stats = fst.stats();
            let total = u64::from(stats.page_count) * u64::from(header.page_size);
            println!("pages:        {}", stats.page_count);
            println!("total records: {total}");
            println!("free records:  {}", stats.free_records);
            println!("free ranges:   {}", stats.ranges);
        }
        Command::Record {
            page,
            record,
            count,
        } => {
            let address = RecordAddress::new(*page, *record);
            let record_size = usize::from(header.record_size);
            let mut raw = Vec::new();
            for i in 0..*count {
                let offset =
                    layout.record_offset(RecordAddress::new(*page, *record + i)) as usize;
                let chunk = region(&bytes, offset, record_size)?;
                raw.extend_from_slice(chunk);
            }
            for (i, line) in raw.chunks(16).enumerate() {
                println!("{:08x}  {}", i * 16, hex::encode(line));
            }
            match parse_header(address, &raw)? {
                Some(info) => {
                    println!("value type:      {:?}", info.value_type);
                    println!("key index:       {}", info.has_key_index);
                    println!("header length:   {} bytes", info.header_len);
                    println!("last record len: {} bytes", info.last_record_len);
                    println!("allocation:");
                    for range in &info.allocation {
                        println!(
                            "  page {} records {}..{}",
                            range.page_nr,
                            range.record_nr,
                            range.record_nr + range.length
                        );
                    }
                }
                None => println!("header incomplete; dump more records with --count"),
            }
        }
    }
    Ok(())
}

fn region(bytes: &[u8], offset: usize, len: usize) -> arbor::Result<&[u8]> {
    bytes.get(offset..offset + len).ok_or_else(|| {
        arbor::ArborError::Corruption("file truncated before region end".into())
    })
}
