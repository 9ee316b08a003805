//! onerng - tool for the OneRNG open source hardware entropy generator.
//!
//! Environment variables:
//!   ONERNG_DEVICE   - Device path (default: /dev/ttyACM0)

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use env_logger::Env;
use log::{debug, warn};

use onerng::protocol::WASTE_BYTES;
use onerng::{CancelToken, NoiseMode, OneRng, PgpKeyring};

/// Vendor firmware signing key.
const VENDOR_KEY: &str = include_str!("../../keys/onerng.asc");

/// Tool for the OneRNG open source hardware entropy generator.
///
/// Verifies that the device operates correctly and that its firmware has
/// not been tampered with, and reads random data from it.
#[derive(Parser)]
#[command(name = "onerng")]
#[command(author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// The OneRNG device.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/dev/ttyACM0",
        env = "ONERNG_DEVICE"
    )]
    device: String,

    /// Armored public key to verify firmware against instead of the vendor key.
    #[arg(long, global = true, value_name = "FILE")]
    keyring: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify that the firmware has not been tampered with.
    Verify,
    /// Display the hardware version.
    Version,
    /// Display the hardware id.
    Id,
    /// Flush the entropy pool.
    Flush,
    /// Initialize the RNG.
    Init,
    /// Dump the firmware image.
    Image {
        /// Output file for the image (use - for stdout).
        #[arg(short, long, default_value = "onerng.img")]
        out: String,
    },
    /// Read random data.
    Read {
        /// Output file for data (use - for stdout).
        #[arg(short, long, default_value = "-")]
        out: String,

        /// Read only N bytes (use -1 for unlimited).
        #[arg(short = 'n', long, default_value_t = -1, allow_negative_numbers = true)]
        count: i64,

        /// Disable noise generation from the avalanche diode.
        #[arg(long)]
        disable_avalanche: bool,

        /// Enable noise generation from RF.
        #[arg(long)]
        enable_rf: bool,

        /// Disable the on-board CRC16 whitener.
        #[arg(long)]
        disable_whitener: bool,

        /// Encrypt the stream with AES-128 under a key obtained from the device.
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        aes_whitener: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("onerng v{} on {}", env!("CARGO_PKG_VERSION"), cli.device);

    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("failed to install Ctrl-C handler")?;

    let mut rng = OneRng::new(cli.device.as_str());

    match &cli.command {
        Commands::Verify => cmd_verify(&mut rng, &token, cli.keyring.as_ref()),
        Commands::Version => {
            let version = rng.version(&token)?;
            println!("OneRNG Hardware Version: {version}");
            Ok(())
        }
        Commands::Id => {
            let id = rng.identify(&token)?;
            println!("OneRNG Hardware ID: {id}");
            Ok(())
        }
        Commands::Flush => Ok(rng.flush(&token)?),
        Commands::Init => Ok(rng.init(&token)?),
        Commands::Image { out } => cmd_image(&mut rng, &token, out),
        Commands::Read {
            out,
            count,
            disable_avalanche,
            enable_rf,
            disable_whitener,
            aes_whitener,
        } => {
            let mode = NoiseMode {
                disable_whitener: *disable_whitener,
                enable_rf: *enable_rf,
                disable_avalanche: *disable_avalanche,
            };
            cmd_read(&mut rng, &token, out, *count, mode, *aes_whitener)
        }
    }
}

fn load_keyring(path: Option<&PathBuf>) -> Result<PgpKeyring> {
    let armored = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read keyring {}", path.display()))?,
        None => VENDOR_KEY.to_string(),
    };
    Ok(PgpKeyring::from_armored(&armored)?)
}

fn cmd_verify(rng: &mut OneRng, token: &CancelToken, keyring: Option<&PathBuf>) -> Result<()> {
    let keyring = load_keyring(keyring)?;
    rng.init(token)
        .context("init failed before image verification")?;
    let image = rng
        .image(token)
        .context("image extraction failed before verification")?;
    let verified = onerng::verify_image(&mut image.as_slice(), &keyring)?;
    println!(
        "firmware verification passed OK (version {})",
        verified.version
    );
    Ok(())
}

fn open_output(path: &str) -> Result<Box<dyn Write>> {
    if path == "-" {
        return Ok(Box::new(io::stdout().lock()));
    }
    let file = File::create(path).with_context(|| format!("failed to create {path}"))?;
    Ok(Box::new(file))
}

fn cmd_image(rng: &mut OneRng, token: &CancelToken, out: &str) -> Result<()> {
    rng.init(token)
        .context("init failed before image extraction")?;
    let image = rng.image(token)?;

    let mut dst = open_output(out)?;
    dst.write_all(&image)?;
    dst.flush()?;
    eprintln!("Wrote {}b to {out}", image.len());
    Ok(())
}

fn cmd_read(
    rng: &mut OneRng,
    token: &CancelToken,
    out: &str,
    count: i64,
    mode: NoiseMode,
    aes_whitener: bool,
) -> Result<()> {
    rng.init(token).context("init failed before read")?;

    if let Err(e) = rng.read(token, &mut io::sink(), Some(WASTE_BYTES as u64), mode) {
        warn!("entropy wastage failed or incomplete, continuing anyway: {e}");
    }

    let dst = open_output(out)?;
    let mut dst: Box<dyn Write> = if aes_whitener {
        Box::new(rng.aes_whitener(token, dst)?)
    } else {
        dst
    };

    let limit = u64::try_from(count).ok();
    let start = Instant::now();
    let result = rng.read(token, &mut dst, limit, mode);
    let elapsed = start.elapsed();
    let written = match &result {
        Ok(n) => *n,
        Err(e) => e.written,
    };
    dst.flush()?;

    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { written as f64 / secs } else { 0.0 };
    eprintln!(
        "{} written in {elapsed:.2?} ({}/s)",
        human_bytes(written as f64),
        human_bytes(rate)
    );

    result?;
    Ok(())
}

/// IEC size, e.g. `1.5 KiB`.
fn human_bytes(n: f64) -> String {
    const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut value = n;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
