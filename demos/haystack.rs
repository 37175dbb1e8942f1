// Axel '0vercl0k' Souchet - October 18 2026
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use haystack::{heap, Address, AddressSpace, MallocChunk, Registry, Session, WordSize};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// The path to the snapshot, a directory or a tar archive.
    dump_path: PathBuf,
    /// The word size of the captured process, in bytes.
    #[arg(short, long, default_value_t = 8)]
    word_size: u64,
    /// Dump the mappings.
    #[arg(short, long)]
    mappings: bool,
    /// Walk the heap regions and list their allocations.
    #[arg(long, default_value_t = false)]
    heap: bool,
    /// Also list the free chunks.
    #[arg(long, default_value_t = false)]
    free: bool,
    /// Dump `len` bytes at this address.
    #[arg(long)]
    mem: Option<Address>,
    /// The number of bytes to dump out.
    #[arg(long, default_value_t = 0x40)]
    len: usize,
}

/// Print `data` sixteen bytes per row; bytes that couldn't be read are
/// displayed as `??`.
fn hexdump(addr: Address, data: &[u8], wanted_len: usize) {
    for row in (0..wanted_len).step_by(16) {
        let row_len = (wanted_len - row).min(16);
        let mut hex = String::new();
        let mut ascii = String::new();
        for idx in row..row + row_len {
            match data.get(idx) {
                Some(&b) => {
                    hex.push_str(&format!("{b:02x} "));
                    let c = char::from(b);
                    ascii.push(if c.is_ascii_graphic() { c } else { '.' });
                }
                None => {
                    hex.push_str("?? ");
                    ascii.push('?');
                }
            }
        }

        println!("{:016x}: {hex:48} {ascii}", addr.u64() + row as u64);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let Ok(word_size) = WordSize::try_from(args.word_size) else {
        bail!("{} isn't a supported word size", args.word_size);
    };

    let mappings = haystack::dump::load(&args.dump_path, word_size)
        .with_context(|| format!("failed to load {}", args.dump_path.display()))?;

    if args.mappings {
        for region in mappings.regions() {
            println!(
                "{:#018x}-{:#018x} {:>10} {}",
                region.start().u64(),
                region.end().u64(),
                if region.is_captured() { "captured" } else { "-" },
                region.label().unwrap_or_default()
            );
        }
    }

    if let Some(addr) = args.mem {
        let mut buffer = vec![0; args.len];
        match mappings.read(addr, &mut buffer) {
            Ok(amount) if amount > 0 => hexdump(addr, &buffer[..amount], args.len),
            _ => println!("There is no memory available at {addr}"),
        }
    }

    if args.heap {
        let mut registry = Registry::new(word_size);
        registry.register_type::<MallocChunk>()?;
        let mut session = Session::new(&registry, &mappings)?;
        for region in mappings
            .regions()
            .filter(|r| r.label() == Some("[heap]") && r.is_captured())
        {
            if !heap::is_heap(&mut session, region) {
                println!("{region:?} doesn't look like a heap");
                continue;
            }

            let (allocated, free) = heap::user_allocations(&mut session, region)?;
            println!(
                "{region:?}: {} allocations, {} free chunks",
                allocated.len(),
                free.len()
            );

            for allocation in allocated {
                println!("  {:#018x} {:#x}", allocation.addr.u64(), allocation.size);
            }

            if args.free {
                for chunk in free {
                    println!("  {:#018x} {:#x} (free)", chunk.addr.u64(), chunk.size);
                }
            }
        }
    }

    Ok(())
}
