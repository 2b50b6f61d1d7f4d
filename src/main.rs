use clap::{Parser, Subcommand};
use obsidian::{scrub, Store};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "obsidian", version = "1.0.0", about = "The obsidian obfuscating block store CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new backing file of the given size
    Create {
        path: PathBuf,
        /// Number of 4 KiB blocks
        #[arg(short, long)]
        blocks: u64,
        /// Owner id, as hex (defaults to all zero)
        #[arg(short, long)]
        owner: Option<String>,
    },
    /// Put a file's bytes into the store, printing its token
    Put {
        backing: PathBuf,
        input: PathBuf,
        /// Description stored alongside the file
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long)]
        owner: Option<String>,
    },
    /// Read a file's bytes out of the store by token
    Get {
        backing: PathBuf,
        token: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Delete a file by token, freeing its blocks
    Delete {
        backing: PathBuf,
        token: String,
    },
    /// Show a file's filename/description/owner without reading its bytes
    Stat {
        backing: PathBuf,
        token: String,
    },
    /// Show backing file metadata
    Info {
        backing: PathBuf,
    },
    /// Report blocks that are allocated but unreachable from the given tokens
    Scrub {
        backing: PathBuf,
        #[arg(required = true, num_args = 1..)]
        tokens: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        Commands::Create { path, blocks, owner } => {
            let owner = parse_owner(&owner)?;
            let store = Store::create(&path, blocks, owner)?;
            println!("Created: {}  ({} blocks, {} MiB)", path.display(), blocks, store.total_size_mib());
        }

        Commands::Put { backing, input, description, owner } => {
            let owner = parse_owner(&owner)?;
            let data = std::fs::read(&input)?;
            let filename = input.file_name().unwrap().to_string_lossy().into_owned();
            let mut store = Store::open_backing(&backing)?;
            let mut session = store.put(&filename, &description, owner);
            session.write(&data)?;
            let token = session.finish()?;
            println!("  put  {} ({} B)", input.display(), data.len());
            println!("Token: {}", token);
        }

        Commands::Get { backing, token, output } => {
            let mut store = Store::open_backing(&backing)?;
            let handle = store.open(&token)?;
            let data = store.read_all(&handle)?;
            std::fs::write(&output, &data)?;
            println!("Read {} B → {}", data.len(), output.display());
        }

        Commands::Delete { backing, token } => {
            let mut store = Store::open_backing(&backing)?;
            store.delete(&token)?;
            println!("Deleted: {}", token);
        }

        Commands::Stat { backing, token } => {
            let mut store = Store::open_backing(&backing)?;
            let handle = store.open(&token)?;
            println!("  filename     {}", handle.meta.filename);
            println!("  description  {}", handle.meta.description);
            println!("  owner        {}", hex::encode(handle.meta.owner));
        }

        Commands::Info { backing } => {
            let store = Store::open_backing(&backing)?;
            let meta = store.backing().metadata();
            let info = store.backing().info();
            println!("── obsidian backing ────────────────────────────────────");
            println!("  Path           {}", backing.display());
            println!("  Format version {}", meta.version);
            println!("  File id        {}", hex::encode(meta.file_id));
            println!("  Owner          {}", hex::encode(meta.owner));
            println!("  Payload range  [{}, {}]", meta.start_block, meta.end_block);
            println!("  Block size     {} B", meta.block_size);
            println!("  Total size     {} MiB", store.total_size_mib());
            println!("  Free size      {} MiB", store.free_size_mib());
            println!("  Checksum ok    {}", store.verify());
            println!("  Created        {}", info.created);
            println!("  Changed        {}", info.changed);
            println!("  Visited        {}", info.visited);
        }

        Commands::Scrub { backing, tokens } => {
            let mut store = Store::open_backing(&backing)?;
            let report = scrub(store.backing_mut(), &tokens)?;
            println!("── scrub report ─────────────────────────────────────────");
            println!("  Total blocks       {}", report.total_blocks);
            println!("  Allocated blocks   {}", report.allocated_blocks);
            println!("  Reachable blocks   {}", report.reachable_blocks);
            println!("  Leaked blocks      {}", report.leaked_blocks.len());
            if !report.leaked_blocks.is_empty() {
                let show = report.leaked_blocks.len().min(10);
                println!("  First few: {:?}", &report.leaked_blocks[..show]);
            }
        }
    }

    Ok(())
}

fn parse_owner(owner: &Option<String>) -> Result<[u8; 32], Box<dyn std::error::Error>> {
    let mut out = [0u8; 32];
    if let Some(hex_str) = owner {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(format!("owner must be exactly 32 bytes (64 hex chars), got {}", bytes.len()).into());
        }
        out.copy_from_slice(&bytes);
    }
    Ok(out)
}
