use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use phantomdag::core::codec::{Decodable, Reader};
use phantomdag::{BehaviorFlags, Block, BlockDag, DagConfig, DagParams, ErrorCode, Storage};

#[derive(Parser)]
#[command(name = "phantomdag", version)]
#[command(about = "PhantomDAG - block-DAG consensus engine")]
struct Cli {
    /// JSON file with network parameters (overrides --simnet)
    #[arg(long, global = true)]
    params: Option<PathBuf>,
    /// Use the simnet preset instead of mainnet
    #[arg(long, global = true)]
    simnet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the state of a stored DAG
    Status {
        #[arg(long)]
        datadir: PathBuf,
    },
    /// Process a file of length-prefixed serialized blocks
    Import {
        #[arg(long)]
        datadir: PathBuf,
        file: PathBuf,
    },
    /// Print the parameter preset as JSON
    Params,
}

fn load_params(cli: &Cli) -> Result<DagParams, Box<dyn Error>> {
    if let Some(path) = &cli.params {
        let json = std::fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&json)?);
    }
    Ok(if cli.simnet { DagParams::simnet() } else { DagParams::mainnet() })
}

fn open_dag(params: DagParams, datadir: &Path) -> Result<Arc<BlockDag>, Box<dyn Error>> {
    std::fs::create_dir_all(datadir)?;
    let storage = Storage::open(datadir.join("dag"))?;
    Ok(Arc::new(BlockDag::new(DagConfig::new(params, storage))?))
}

fn print_status(dag: &BlockDag) {
    let params = dag.params();
    println!("📊 PhantomDAG ({})", params.name);
    println!("  Genesis:        {}", dag.genesis_hash());
    println!("  Selected tip:   {}", dag.selected_tip_hash());
    println!("  Tips:           {}", dag.tip_hashes().len());
    for tip in dag.tip_hashes() {
        println!("    {}", tip);
    }
    println!("  Blocks:         {}", dag.block_count());
    println!("  Blue score:     {}", dag.virtual_blue_score());
    match dag.last_finality_point() {
        Some(point) => println!("  Finality point: {}", point),
        None => println!("  Finality point: -"),
    }
    println!("  UTXOs:          {}", dag.utxo_count());
    println!("  Commitment:     {}", dag.utxo_commitment());
}

fn import(dag: &BlockDag, file: &Path) -> Result<(), Box<dyn Error>> {
    let data = std::fs::read(file)?;
    let mut reader = Reader::new(&data);
    let start = std::time::Instant::now();
    let (mut imported, mut skipped, mut pending) = (0u64, 0u64, 0u64);

    while reader.remaining() > 0 {
        let len = reader.read_count()?;
        let block = Block::from_bytes(reader.read_bytes(len)?)?;
        let hash = block.hash();
        match dag.process_block(block, BehaviorFlags::empty()) {
            Ok(outcome) if outcome.is_orphan || outcome.is_delayed => pending += 1,
            Ok(_) => {
                imported += 1;
                if imported % 100 == 0 {
                    println!("  📥 Imported {} blocks...", imported);
                }
            }
            Err(e) if e.rule_code() == Some(ErrorCode::DuplicateBlock) => skipped += 1,
            Err(e) => {
                eprintln!("❌ Block {} rejected: {}", hash, e);
                return Err(e.into());
            }
        }
    }
    dag.close()?;

    println!(
        "✅ Imported {} blocks in {:.1}s ({} already known, {} waiting as orphan or delayed)",
        imported,
        start.elapsed().as_secs_f64(),
        skipped,
        pending
    );
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let params = load_params(&cli)?;
    match cli.command {
        Commands::Status { datadir } => {
            let dag = open_dag(params, &datadir)?;
            print_status(&dag);
        }
        Commands::Import { datadir, file } => {
            let dag = open_dag(params, &datadir)?;
            import(&dag, &file)?;
            print_status(&dag);
        }
        Commands::Params => println!("{}", serde_json::to_string_pretty(&params)?),
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("phantomdag=info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}
