use anyhow::Result;
use clap::Parser;

use afno_lib::bench;
use afno_lib::config::Args;
use afno_lib::memory::TrackingAllocator;
use afno_lib::telemetry::init_tracing;

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();
    let cfg = args.resolve()?;
    let reports = bench::run(&cfg)?;
    if let Some(report) = reports.first() {
        println!("{report}");
    }
    Ok(())
}
