use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use ems_cart::device_ids;
use ems_cart::protocol::{self, Memory};
use ems_cart::session::{self, Notify, Session};
use ems_cart::transport::UsbTransport;
use log::{info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "ems-cart", version, about)]
struct Opt {
    /// Give up on any single USB transfer after this many milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all connected EMS carts (USB ID 4670:9394)
    List,

    /// Read a region of cart memory into a file
    Read {
        #[command(flatten)]
        region: Region,

        /// Number of bytes to read (decimal or 0x-prefixed hex)
        #[arg(short, long, value_parser = parse_u32)]
        len: u32,

        file: PathBuf,
    },

    /// Write the contents of a file into cart memory
    Write {
        #[command(flatten)]
        region: Region,

        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct Region {
    /// Memory to access
    #[arg(short, long, value_enum, default_value_t = MemoryArg::Rom)]
    memory: MemoryArg,

    /// Start address (decimal or 0x-prefixed hex)
    #[arg(short, long, value_parser = parse_u32, default_value = "0")]
    offset: u32,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MemoryArg {
    Rom,
    Sram,
}

impl From<MemoryArg> for Memory {
    fn from(arg: MemoryArg) -> Self {
        match arg {
            MemoryArg::Rom => Memory::Rom,
            MemoryArg::Sram => Memory::Sram,
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

/// Surfaces readiness changes in the log. Failures are already logged by the session.
struct Status;

impl Notify for Status {
    fn ready_changed(&mut self, ready: bool) {
        if ready {
            info!("Cart connected");
        } else {
            warn!("Lost connection to cart");
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("EMS_CART_LOG", "info")
            .write_style("EMS_CART_LOG_STYLE"),
    )
    .init();

    let opt = Opt::parse();

    match opt.command {
        Command::List => list()?,
        Command::Read { region, len, file } => {
            let mut session = open_session(opt.timeout)?;
            create_or_remove(&file, |out| {
                protocol::dump(&mut session, region.memory.into(), region.offset, len, out)
            })?;
        }
        Command::Write { region, file } => {
            let mut session = open_session(opt.timeout)?;
            let mut file = File::open(file)?;
            let written =
                protocol::flash(&mut session, region.memory.into(), region.offset, &mut file)?;
            println!("Wrote {written} bytes");
        }
    };

    Ok(())
}

fn open_session(timeout_ms: u64) -> Result<Session<UsbTransport, Status>> {
    let mut session = Session::initialize(Status)?;
    session.set_timeout(Duration::from_millis(timeout_ms));
    session.find_device()?;
    Ok(session)
}

/// Create `path` and fill it with `fill`. If filling fails, the partial file is removed.
fn create_or_remove<E>(
    path: &Path,
    fill: impl FnOnce(&mut File) -> Result<(), E>,
) -> Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let mut file = File::create(path)?;
    let result = fill(&mut file);
    drop(file);

    if result.is_err() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove partial file {}: {e}", path.display());
        }
    }

    Ok(result?)
}

fn list() -> Result<()> {
    let transport = UsbTransport::new()?;
    for location in session::list_carts(&transport)? {
        println!("{location}: {} EMS 64M cart", device_ids::EMS_CART);
    }

    Ok(())
}
